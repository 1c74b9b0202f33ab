//! Component G: serializes the compiled globals and functions into the
//! big-endian image format. Byte layout is an external contract (see the
//! opcode table in `bytecode.rs`) and must not drift.

use byteorder::{BigEndian, WriteBytesExt};

use crate::bytecode::{Instruction, Operand};
use crate::symbols::{FunctionTable, GlobalTable};

const MAGIC: u32 = 0x72303b3e;
const VERSION: u32 = 0x0000_0001;

pub fn assemble(globals: &GlobalTable, functions: &FunctionTable) -> Vec<u8> {
    let mut out = Vec::new();

    out.write_u32::<BigEndian>(MAGIC).expect("writing to a Vec never fails");
    out.write_u32::<BigEndian>(VERSION).expect("writing to a Vec never fails");

    out.write_u32::<BigEndian>(globals.len()).expect("writing to a Vec never fails");
    for g in &globals.globals {
        out.write_u8(u8::from(g.is_constant)).expect("writing to a Vec never fails");
        out.write_u32::<BigEndian>(g.value_bytes.len() as u32)
            .expect("writing to a Vec never fails");
        out.extend_from_slice(&g.value_bytes);
    }

    let ordered = functions.ordered();
    out.write_u32::<BigEndian>(ordered.len() as u32)
        .expect("writing to a Vec never fails");
    for f in ordered {
        out.write_u32::<BigEndian>(f.name_global_index).expect("writing to a Vec never fails");
        out.write_u32::<BigEndian>(f.return_slots).expect("writing to a Vec never fails");
        out.write_u32::<BigEndian>(f.param_count).expect("writing to a Vec never fails");
        out.write_u32::<BigEndian>(f.local_slot_count).expect("writing to a Vec never fails");
        out.write_u32::<BigEndian>(f.instructions.len() as u32)
            .expect("writing to a Vec never fails");
        for instr in &f.instructions {
            write_instruction(&mut out, instr);
        }
    }

    out
}

fn write_instruction(out: &mut Vec<u8>, instr: &Instruction) {
    out.push(instr.op.byte());
    match instr.operand {
        Operand::None => {}
        Operand::U32(v) => out.write_u32::<BigEndian>(v).expect("writing to a Vec never fails"),
        Operand::I32(v) => out.write_i32::<BigEndian>(v).expect("writing to a Vec never fails"),
        Operand::U64(v) => out.write_u64::<BigEndian>(v).expect("writing to a Vec never fails"),
    }
}
