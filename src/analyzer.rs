//! The fused parser / semantic analyzer / emitter: component F.
//!
//! Recursive-descent over the token buffer. Each production analyzes types
//! as it goes and emits instructions directly into the enclosing function's
//! instruction list; there is no separate AST pass.

use crate::bytecode::{Instruction, Opcode, Operand};
use crate::error::{CompileError, Position};
use crate::lexer::TokenKind;
use crate::precedence::{BinOp, OperatorStack, Prioritized};
use crate::symbols::{
    FunctionDef, FunctionTable, GlobalDef, GlobalTable, Parameter, ParamList, Symbol, SymbolTable,
    Type,
};
use crate::token_buffer::TokenBuffer;

impl Prioritized for (BinOp, Type) {
    fn priority(&self) -> u8 {
        self.0.precedence()
    }
}

/// Library functions callable by name via `callname`; signatures are not
/// part of the external opcode contract but are needed here to type-check
/// call sites the same way a user-defined function's signature is.
const LIBRARY_FUNCTIONS: &[(&str, &[Type], Type)] = &[
    ("getint", &[], Type::Int),
    ("getdouble", &[], Type::Double),
    ("getchar", &[], Type::Int),
    ("putint", &[Type::Int], Type::Void),
    ("putdouble", &[Type::Double], Type::Void),
    ("putchar", &[Type::Int], Type::Void),
    ("putstr", &[Type::Int], Type::Void),
    ("putln", &[], Type::Void),
];

fn lookup_library(name: &str) -> Option<(&'static [Type], Type)> {
    LIBRARY_FUNCTIONS
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, params, ret)| (*params, *ret))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Function,
    Global,
}

#[derive(Debug, Clone, Copy)]
enum CmpScratch {
    Local(u32),
    Global(u32),
}

struct LoopCtx {
    loop_top: u32,
    break_patches: Vec<u32>,
}

/// Per-function (or per-global-initializer) emission state. One of these
/// exists for each user function body and a single persistent one
/// (`Analyzer::global_ctx`) accumulates the global initializer prelude that
/// gets prepended to `_start`.
struct FuncCtx {
    kind: ScopeKind,
    param_base: u32,
    params: ParamList,
    symbols: SymbolTable,
    level: u32,
    local_slot_count: u32,
    instructions: Vec<Instruction>,
    return_type: Type,
    have_return: bool,
    loops: Vec<LoopCtx>,
    cmp_scratch: Option<CmpScratch>,
}

impl Default for FuncCtx {
    fn default() -> Self {
        FuncCtx {
            kind: ScopeKind::Global,
            param_base: 0,
            params: ParamList::new(),
            symbols: SymbolTable::new(),
            level: 0,
            local_slot_count: 0,
            instructions: Vec::new(),
            return_type: Type::Void,
            have_return: false,
            loops: Vec::new(),
            cmp_scratch: None,
        }
    }
}

impl FuncCtx {
    fn for_function(param_base: u32, params: ParamList, return_type: Type) -> Self {
        FuncCtx {
            kind: ScopeKind::Function,
            param_base,
            params,
            return_type,
            ..FuncCtx::default()
        }
    }

    fn emit(&mut self, instr: Instruction) -> u32 {
        let idx = self.instructions.len() as u32;
        self.instructions.push(instr);
        idx
    }

    fn current_index(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn patch_branch(&mut self, instr_index: u32, target_index: u32) {
        let displacement = target_index as i32 - instr_index as i32;
        self.instructions[instr_index as usize].operand = Operand::I32(displacement);
    }

    fn alloc_local_slot(&mut self) -> u32 {
        let offset = self.local_slot_count;
        self.local_slot_count += 1;
        offset
    }
}

pub struct Analyzer<'src> {
    tokens: TokenBuffer<'src>,
    globals: GlobalTable,
    global_symbols: SymbolTable,
    functions: FunctionTable,
    next_function_id: u32,
    global_ctx: FuncCtx,
}

impl<'src> Analyzer<'src> {
    pub fn new(source: &'src str) -> Self {
        Analyzer {
            tokens: TokenBuffer::new(source),
            globals: GlobalTable::new(),
            global_symbols: SymbolTable::new(),
            functions: FunctionTable::new(),
            next_function_id: 1,
            global_ctx: FuncCtx::default(),
        }
    }

    pub fn analyze(mut self) -> Result<(GlobalTable, FunctionTable), CompileError> {
        while !self.tokens.check(&TokenKind::Eof)? {
            if self.tokens.check(&TokenKind::KwFn)? {
                self.parse_function()?;
            } else {
                self.parse_global_decl_stmt()?;
            }
        }
        self.synth_start()?;
        Ok((self.globals, self.functions))
    }

    fn expect_ident(&mut self) -> Result<(String, Position), CompileError> {
        let tok = self.tokens.expect(&TokenKind::Ident(String::new()))?;
        match tok.kind {
            TokenKind::Ident(name) => Ok((name, tok.start)),
            _ => unreachable!("expect(&Ident) guarantees an Ident token"),
        }
    }

    /// `int`, `double`, and `void` are not keywords; they're plain
    /// identifiers recognized here by value.
    fn expect_ty(&mut self) -> Result<(Type, Position), CompileError> {
        let (name, pos) = self.expect_ident()?;
        let ty = Type::from_name(&name).ok_or(CompileError::NotValidReturn(pos))?;
        Ok((ty, pos))
    }

    fn name_clashes(&self, ctx: &FuncCtx, name: &str, level: u32) -> bool {
        ctx.symbols.has_at_level(name, level)
            || ctx.params.find(name).is_some()
            || self.functions.contains(name)
    }

    // ---- top-level items ----------------------------------------------

    fn parse_function(&mut self) -> Result<(), CompileError> {
        let fn_pos = self.tokens.peek()?.start;
        self.tokens.expect(&TokenKind::KwFn)?;
        let (name, name_pos) = self.expect_ident()?;
        if self.functions.contains(&name) || self.global_symbols.has_at_level(&name, 0) {
            return Err(CompileError::DuplicateDeclaration(name_pos));
        }

        self.tokens.expect(&TokenKind::LParen)?;
        let mut params = ParamList::new();
        if !self.tokens.check(&TokenKind::RParen)? {
            loop {
                let is_const_param = self.tokens.accept(&TokenKind::KwConst)?.is_some();
                let (pname, ppos) = self.expect_ident()?;
                self.tokens.expect(&TokenKind::Colon)?;
                let (pty, _) = self.expect_ty()?;
                if params.find(&pname).is_some() {
                    return Err(CompileError::DuplicateDeclaration(ppos));
                }
                params.params.push(Parameter {
                    name: pname,
                    ty: pty,
                    is_constant: is_const_param,
                });
                if self.tokens.accept(&TokenKind::Comma)?.is_none() {
                    break;
                }
            }
        }
        self.tokens.expect(&TokenKind::RParen)?;
        self.tokens.expect(&TokenKind::Arrow)?;
        let (return_type, _) = self.expect_ty()?;

        let param_base = if return_type != Type::Void { 1 } else { 0 };
        let function_id = self.next_function_id;
        self.next_function_id += 1;
        let param_types: Vec<Type> = params.params.iter().map(|p| p.ty).collect();
        let param_count = params.params.len() as u32;

        // Register before analyzing the body: forbids redefinition and lets
        // the body call itself by name.
        let name_global_index = self.globals.push(GlobalDef::string(&name));
        self.functions.insert(
            name.clone(),
            FunctionDef {
                name_global_index,
                return_slots: param_base,
                param_count,
                param_types,
                local_slot_count: 0,
                instructions: Vec::new(),
                function_id,
                return_type,
            },
        );

        let mut ctx = FuncCtx::for_function(param_base, params, return_type);
        self.parse_block(&mut ctx)?;

        if return_type == Type::Void {
            ctx.emit(Instruction::nullary(Opcode::Ret));
        } else if !ctx.have_return {
            return Err(CompileError::NotValidReturn(fn_pos));
        }

        let def = self.functions.functions.get_mut(&name).expect("just inserted above");
        def.instructions = ctx.instructions;
        def.local_slot_count = ctx.local_slot_count;
        Ok(())
    }

    fn parse_global_decl_stmt(&mut self) -> Result<(), CompileError> {
        let is_const = self.tokens.check(&TokenKind::KwConst)?;
        if is_const {
            self.tokens.next()?;
        } else {
            self.tokens.expect(&TokenKind::KwLet)?;
        }
        let (name, pos) = self.expect_ident()?;
        self.tokens.expect(&TokenKind::Colon)?;
        let (ty, ty_pos) = self.expect_ty()?;
        if ty == Type::Void {
            return Err(CompileError::NotValidReturn(ty_pos));
        }
        if self.global_symbols.has_at_level(&name, 0) || self.functions.contains(&name) {
            return Err(CompileError::DuplicateDeclaration(pos));
        }

        let offset = self.globals.push(GlobalDef::uninitialized_variable());
        let mut initialized = false;
        if self.tokens.accept(&TokenKind::Eq)?.is_some() {
            let mut ctx = std::mem::take(&mut self.global_ctx);
            ctx.emit(Instruction::with_u32(Opcode::Globa, offset));
            let rhs_ty = self.parse_expr(&mut ctx);
            let rhs_ty = match rhs_ty {
                Ok(ty) => ty,
                Err(e) => {
                    self.global_ctx = ctx;
                    return Err(e);
                }
            };
            if rhs_ty != ty {
                self.global_ctx = ctx;
                return Err(CompileError::InvalidAssignment(pos));
            }
            ctx.emit(Instruction::nullary(Opcode::Store));
            self.global_ctx = ctx;
            initialized = true;
        } else if is_const {
            return Err(CompileError::InvalidAssignment(pos));
        }
        self.tokens.expect(&TokenKind::Semi)?;

        self.global_symbols.declare(Symbol {
            is_constant: is_const,
            is_initialized: initialized,
            name,
            level: 0,
            ty,
            offset,
        });
        Ok(())
    }

    fn synth_start(&mut self) -> Result<(), CompileError> {
        let eof_pos = self.tokens.peek()?.start;
        let (main_id, main_returns) = {
            let main_def = self.functions.get("main").ok_or(CompileError::NoMain(eof_pos))?;
            (main_def.function_id, main_def.return_type != Type::Void)
        };

        let mut instructions = std::mem::take(&mut self.global_ctx).instructions;
        instructions.push(Instruction::with_u32(Opcode::StackAlloc, u32::from(main_returns)));
        instructions.push(Instruction::with_u32(Opcode::Call, main_id));
        if main_returns {
            instructions.push(Instruction::with_u32(Opcode::Popn, 1));
        }
        instructions.push(Instruction::nullary(Opcode::Ret));

        let name_global_index = self.globals.push(GlobalDef::string("_start"));
        self.functions.insert(
            "_start".to_string(),
            FunctionDef {
                name_global_index,
                return_slots: 0,
                param_count: 0,
                param_types: Vec::new(),
                local_slot_count: 0,
                instructions,
                function_id: 0,
                return_type: Type::Void,
            },
        );
        Ok(())
    }

    // ---- statements -----------------------------------------------------

    fn parse_block(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        self.tokens.expect(&TokenKind::LBrace)?;
        ctx.level += 1;
        let level = ctx.level;
        while !self.tokens.check(&TokenKind::RBrace)? {
            self.parse_stmt(ctx)?;
        }
        self.tokens.expect(&TokenKind::RBrace)?;
        ctx.symbols.truncate_to_below(level);
        ctx.level -= 1;
        Ok(())
    }

    fn parse_stmt(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        if self.tokens.accept(&TokenKind::Semi)?.is_some() {
            return Ok(());
        }
        if self.tokens.check(&TokenKind::LBrace)? {
            return self.parse_block(ctx);
        }
        if self.tokens.check(&TokenKind::KwLet)? || self.tokens.check(&TokenKind::KwConst)? {
            return self.parse_local_decl(ctx);
        }
        if self.tokens.check(&TokenKind::KwIf)? {
            return self.parse_if(ctx);
        }
        if self.tokens.check(&TokenKind::KwWhile)? {
            return self.parse_while(ctx);
        }
        if self.tokens.check(&TokenKind::KwBreak)? {
            return self.parse_break(ctx);
        }
        if self.tokens.check(&TokenKind::KwContinue)? {
            return self.parse_continue(ctx);
        }
        if self.tokens.check(&TokenKind::KwReturn)? {
            return self.parse_return(ctx);
        }
        self.parse_expr(ctx)?;
        self.tokens.expect(&TokenKind::Semi)?;
        Ok(())
    }

    fn parse_local_decl(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        let is_const = self.tokens.check(&TokenKind::KwConst)?;
        if is_const {
            self.tokens.next()?;
        } else {
            self.tokens.expect(&TokenKind::KwLet)?;
        }
        let (name, pos) = self.expect_ident()?;
        self.tokens.expect(&TokenKind::Colon)?;
        let (ty, ty_pos) = self.expect_ty()?;
        if ty == Type::Void {
            return Err(CompileError::NotValidReturn(ty_pos));
        }
        if self.name_clashes(ctx, &name, ctx.level) {
            return Err(CompileError::DuplicateDeclaration(pos));
        }

        let offset = ctx.alloc_local_slot();
        let mut initialized = false;
        if self.tokens.accept(&TokenKind::Eq)?.is_some() {
            ctx.emit(Instruction::with_u32(Opcode::Loca, offset));
            let rhs_ty = self.parse_expr(ctx)?;
            if rhs_ty != ty {
                return Err(CompileError::InvalidAssignment(pos));
            }
            ctx.emit(Instruction::nullary(Opcode::Store));
            initialized = true;
        } else if is_const {
            return Err(CompileError::InvalidAssignment(pos));
        }
        self.tokens.expect(&TokenKind::Semi)?;

        ctx.symbols.declare(Symbol {
            is_constant: is_const,
            is_initialized: initialized,
            name,
            level: ctx.level,
            ty,
            offset,
        });
        Ok(())
    }

    fn parse_condition(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        let pos = self.tokens.peek()?.start;
        let ty = self.parse_expr(ctx)?;
        if ty != Type::Int {
            return Err(CompileError::TypeError(pos));
        }
        Ok(())
    }

    fn parse_if(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        self.tokens.expect(&TokenKind::KwIf)?;
        self.parse_condition(ctx)?;
        ctx.emit(Instruction::branch(Opcode::BrTrue, 1));
        let ph1 = ctx.emit(Instruction::branch(Opcode::Br, 0));
        self.parse_block(ctx)?;
        let ph2 = ctx.emit(Instruction::branch(Opcode::Br, 0));
        ctx.patch_branch(ph1, ctx.current_index());

        if self.tokens.accept(&TokenKind::KwElse)?.is_some() {
            if self.tokens.check(&TokenKind::KwIf)? {
                self.parse_if(ctx)?;
            } else {
                self.parse_block(ctx)?;
            }
        }
        ctx.patch_branch(ph2, ctx.current_index());
        Ok(())
    }

    fn parse_while(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        self.tokens.expect(&TokenKind::KwWhile)?;
        let loop_top = ctx.current_index();
        self.parse_condition(ctx)?;
        ctx.emit(Instruction::branch(Opcode::BrTrue, 1));
        let ph = ctx.emit(Instruction::branch(Opcode::Br, 0));

        ctx.loops.push(LoopCtx {
            loop_top,
            break_patches: Vec::new(),
        });
        self.parse_block(ctx)?;

        let back_edge = ctx.current_index();
        ctx.emit(Instruction::branch(Opcode::Br, loop_top as i32 - back_edge as i32));
        let exit_index = ctx.current_index();
        ctx.patch_branch(ph, exit_index);

        let loop_ctx = ctx.loops.pop().expect("pushed just above");
        for break_idx in loop_ctx.break_patches {
            ctx.patch_branch(break_idx, exit_index);
        }
        Ok(())
    }

    fn parse_break(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        let pos = self.tokens.peek()?.start;
        self.tokens.expect(&TokenKind::KwBreak)?;
        self.tokens.expect(&TokenKind::Semi)?;
        if ctx.loops.is_empty() {
            return Err(CompileError::NotWhile(pos));
        }
        let idx = ctx.emit(Instruction::branch(Opcode::Br, 0));
        ctx.loops.last_mut().expect("checked non-empty above").break_patches.push(idx);
        Ok(())
    }

    fn parse_continue(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        let pos = self.tokens.peek()?.start;
        self.tokens.expect(&TokenKind::KwContinue)?;
        self.tokens.expect(&TokenKind::Semi)?;
        let loop_top = ctx.loops.last().ok_or(CompileError::NotWhile(pos))?.loop_top;
        let idx = ctx.current_index();
        ctx.emit(Instruction::branch(Opcode::Br, loop_top as i32 - idx as i32));
        Ok(())
    }

    fn parse_return(&mut self, ctx: &mut FuncCtx) -> Result<(), CompileError> {
        let pos = self.tokens.peek()?.start;
        self.tokens.expect(&TokenKind::KwReturn)?;
        if ctx.return_type == Type::Void {
            if !self.tokens.check(&TokenKind::Semi)? {
                return Err(CompileError::NotValidReturn(pos));
            }
            self.tokens.next()?;
            ctx.emit(Instruction::nullary(Opcode::Ret));
            return Ok(());
        }
        if self.tokens.check(&TokenKind::Semi)? {
            return Err(CompileError::NotValidReturn(pos));
        }
        ctx.emit(Instruction::with_u32(Opcode::Arga, 0));
        let ty = self.parse_expr(ctx)?;
        if ty != ctx.return_type {
            return Err(CompileError::NotValidReturn(pos));
        }
        self.tokens.expect(&TokenKind::Semi)?;
        ctx.emit(Instruction::nullary(Opcode::Store));
        ctx.emit(Instruction::nullary(Opcode::Ret));
        ctx.have_return = true;
        Ok(())
    }

    // ---- expressions ------------------------------------------------------

    fn parse_expr(&mut self, ctx: &mut FuncCtx) -> Result<Type, CompileError> {
        let mut current_ty = self.parse_unary_or_primary(ctx)?;
        let mut ops: OperatorStack<(BinOp, Type)> = OperatorStack::new();

        loop {
            if self.tokens.accept(&TokenKind::KwAs)?.is_some() {
                let (target_ty, pos) = self.expect_ty()?;
                current_ty = self.emit_conversion(ctx, current_ty, target_ty, pos)?;
                continue;
            }

            let peek_kind = self.tokens.peek()?.kind.clone();
            let op2 = match BinOp::from_token(&peek_kind) {
                Some(op) => op,
                None => break,
            };
            let pos = self.tokens.peek()?.start;
            self.tokens.next()?;

            let lhs_ty = current_ty;
            ops.push_with_drain((op2, lhs_ty), |entry| self.emit_queued_op(ctx, entry))?;
            if matches!(op2, BinOp::Eq | BinOp::Ne) {
                let scratch = self.ensure_cmp_scratch(ctx);
                ctx.emit(Self::scratch_addr_instr(scratch));
            }

            let rhs_ty = self.parse_unary_or_primary(ctx)?;
            if rhs_ty != lhs_ty {
                return Err(CompileError::TypeError(pos));
            }
            current_ty = if op2.is_comparison() { Type::Int } else { lhs_ty };
        }

        ops.drain_all(|entry| self.emit_queued_op(ctx, entry))?;
        Ok(current_ty)
    }

    fn parse_unary_or_primary(&mut self, ctx: &mut FuncCtx) -> Result<Type, CompileError> {
        if self.tokens.accept(&TokenKind::Minus)?.is_some() {
            let pos = self.tokens.peek()?.start;
            let ty = self.parse_unary_or_primary(ctx)?;
            match ty {
                Type::Int => {
                    ctx.emit(Instruction::nullary(Opcode::NegI));
                }
                Type::Double => {
                    ctx.emit(Instruction::nullary(Opcode::NegF));
                }
                Type::Void => return Err(CompileError::TypeError(pos)),
            }
            return Ok(ty);
        }
        if self.tokens.accept(&TokenKind::LParen)?.is_some() {
            let ty = self.parse_expr(ctx)?;
            self.tokens.expect(&TokenKind::RParen)?;
            return Ok(ty);
        }

        let tok = self.tokens.peek()?.clone();
        match tok.kind {
            TokenKind::Ident(_) => self.parse_ident_primary(ctx),
            TokenKind::UintLiteral(v) => {
                self.tokens.next()?;
                ctx.emit(Instruction::push_u64(v));
                Ok(Type::Int)
            }
            TokenKind::DoubleLiteral(bits) => {
                self.tokens.next()?;
                ctx.emit(Instruction::push_u64(bits));
                Ok(Type::Double)
            }
            TokenKind::CharLiteral(v) => {
                self.tokens.next()?;
                ctx.emit(Instruction::push_u64(v));
                Ok(Type::Int)
            }
            TokenKind::StringLiteral(s) => {
                self.tokens.next()?;
                let idx = self.globals.push(GlobalDef::string(&s));
                ctx.emit(Instruction::push_u64(u64::from(idx)));
                Ok(Type::Int)
            }
            _ => Err(CompileError::InvalidInput(tok.start)),
        }
    }

    fn parse_ident_primary(&mut self, ctx: &mut FuncCtx) -> Result<Type, CompileError> {
        let (name, pos) = self.expect_ident()?;
        if self.tokens.accept(&TokenKind::Eq)?.is_some() {
            return self.parse_assignment(ctx, &name, pos);
        }
        if self.tokens.accept(&TokenKind::LParen)?.is_some() {
            return self.parse_call(ctx, &name, pos);
        }
        self.parse_ident_rvalue(ctx, &name, pos)
    }

    fn parse_ident_rvalue(
        &mut self,
        ctx: &mut FuncCtx,
        name: &str,
        pos: Position,
    ) -> Result<Type, CompileError> {
        if let Some(sym) = ctx.symbols.lookup(name) {
            let (offset, ty) = (sym.offset, sym.ty);
            ctx.emit(Instruction::with_u32(Opcode::Loca, offset));
            ctx.emit(Instruction::nullary(Opcode::Load));
            return Ok(ty);
        }
        if let Some((idx, param)) = ctx.params.find(name) {
            let addr = ctx.param_base + idx as u32;
            let ty = param.ty;
            ctx.emit(Instruction::with_u32(Opcode::Arga, addr));
            ctx.emit(Instruction::nullary(Opcode::Load));
            return Ok(ty);
        }
        if let Some(sym) = self.global_symbols.lookup(name) {
            let (offset, ty) = (sym.offset, sym.ty);
            ctx.emit(Instruction::with_u32(Opcode::Globa, offset));
            ctx.emit(Instruction::nullary(Opcode::Load));
            return Ok(ty);
        }
        Err(CompileError::NotDeclared(pos))
    }

    fn parse_assignment(
        &mut self,
        ctx: &mut FuncCtx,
        name: &str,
        pos: Position,
    ) -> Result<Type, CompileError> {
        let (addr_op, offset, ty, is_const) = if let Some(sym) = ctx.symbols.lookup(name) {
            (Opcode::Loca, sym.offset, sym.ty, sym.is_constant)
        } else if let Some((idx, param)) = ctx.params.find(name) {
            (Opcode::Arga, ctx.param_base + idx as u32, param.ty, param.is_constant)
        } else if let Some(sym) = self.global_symbols.lookup(name) {
            (Opcode::Globa, sym.offset, sym.ty, sym.is_constant)
        } else {
            return Err(CompileError::NotDeclared(pos));
        };
        if is_const {
            return Err(CompileError::AssignToConstant(pos));
        }
        if ty == Type::Void {
            return Err(CompileError::InvalidAssignment(pos));
        }

        ctx.emit(Instruction::with_u32(addr_op, offset));
        let rhs_ty = self.parse_expr(ctx)?;
        if rhs_ty != ty {
            return Err(CompileError::InvalidAssignment(pos));
        }
        ctx.emit(Instruction::nullary(Opcode::Store));

        if let Some(sym) = ctx.symbols.lookup_mut(name) {
            sym.is_initialized = true;
        } else if let Some(sym) = self.global_symbols.lookup_mut(name) {
            sym.is_initialized = true;
        }
        Ok(Type::Void)
    }

    fn parse_call(
        &mut self,
        ctx: &mut FuncCtx,
        name: &str,
        pos: Position,
    ) -> Result<Type, CompileError> {
        enum Callee {
            Library,
            User(u32),
        }

        let (callee, param_types, return_type) = if let Some((ptypes, rtype)) = lookup_library(name) {
            (Callee::Library, ptypes.to_vec(), rtype)
        } else if let Some(def) = self.functions.get(name) {
            (Callee::User(def.function_id), def.param_types.clone(), def.return_type)
        } else {
            return Err(CompileError::NotDeclared(pos));
        };

        let returns_value = return_type != Type::Void;
        ctx.emit(Instruction::with_u32(Opcode::StackAlloc, u32::from(returns_value)));

        let mut arg_types = Vec::new();
        if !self.tokens.check(&TokenKind::RParen)? {
            loop {
                arg_types.push(self.parse_expr(ctx)?);
                if self.tokens.accept(&TokenKind::Comma)?.is_none() {
                    break;
                }
            }
        }
        self.tokens.expect(&TokenKind::RParen)?;

        if arg_types.len() != param_types.len()
            || arg_types.iter().zip(param_types.iter()).any(|(a, p)| a != p)
        {
            return Err(CompileError::ParamError(pos));
        }

        // The callee's own name global is pushed only now, after argument
        // globals (e.g. string literals) have already landed.
        let call_instr = match callee {
            Callee::Library => {
                let global_idx = self.globals.push(GlobalDef::string(name));
                Instruction::with_u32(Opcode::CallName, global_idx)
            }
            Callee::User(function_id) => Instruction::with_u32(Opcode::Call, function_id),
        };
        ctx.emit(call_instr);
        Ok(return_type)
    }

    fn emit_conversion(
        &self,
        ctx: &mut FuncCtx,
        from: Type,
        to: Type,
        pos: Position,
    ) -> Result<Type, CompileError> {
        if from == Type::Void || to == Type::Void {
            return Err(CompileError::TypeError(pos));
        }
        if from == to {
            return Ok(to);
        }
        match (from, to) {
            (Type::Int, Type::Double) => {
                ctx.emit(Instruction::nullary(Opcode::ItoF));
            }
            (Type::Double, Type::Int) => {
                ctx.emit(Instruction::nullary(Opcode::FtoI));
            }
            _ => unreachable!("int/double are the only non-void types"),
        }
        Ok(to)
    }

    // ---- operator draining -------------------------------------------------

    /// `==`/`!=` need both `setLt` and `setGt` derived from a single `cmpi`/
    /// `cmpf`, but the opcode table has no `dup`. The value is spilled to a
    /// scratch slot (a local inside a function, a dedicated global at top
    /// level) and reloaded twice instead of evaluating the operands again.
    fn ensure_cmp_scratch(&mut self, ctx: &mut FuncCtx) -> CmpScratch {
        if let Some(s) = ctx.cmp_scratch {
            return s;
        }
        let scratch = match ctx.kind {
            ScopeKind::Function => CmpScratch::Local(ctx.alloc_local_slot()),
            ScopeKind::Global => CmpScratch::Global(self.globals.push(GlobalDef::uninitialized_variable())),
        };
        ctx.cmp_scratch = Some(scratch);
        scratch
    }

    fn scratch_addr_instr(scratch: CmpScratch) -> Instruction {
        match scratch {
            CmpScratch::Local(offset) => Instruction::with_u32(Opcode::Loca, offset),
            CmpScratch::Global(offset) => Instruction::with_u32(Opcode::Globa, offset),
        }
    }

    /// `1 - x` for a 0/1 boolean `x` already on top of the stack, using
    /// `negi`/`push`/`add` since there is no dedicated boolean-not opcode.
    fn emit_bool_complement(ctx: &mut FuncCtx) {
        ctx.emit(Instruction::nullary(Opcode::NegI));
        ctx.emit(Instruction::push_u64(1));
        ctx.emit(Instruction::nullary(Opcode::Add));
    }

    fn emit_queued_op(&mut self, ctx: &mut FuncCtx, entry: (BinOp, Type)) -> Result<(), CompileError> {
        let (op, ty) = entry;
        let cmp_op = if ty == Type::Double { Opcode::CmpF } else { Opcode::CmpI };
        match op {
            BinOp::Add => {
                ctx.emit(Instruction::nullary(if ty == Type::Double { Opcode::AddF } else { Opcode::Add }));
            }
            BinOp::Sub => {
                ctx.emit(Instruction::nullary(if ty == Type::Double { Opcode::SubF } else { Opcode::Sub }));
            }
            BinOp::Mul => {
                ctx.emit(Instruction::nullary(if ty == Type::Double { Opcode::MulF } else { Opcode::Mul }));
            }
            BinOp::Div => {
                ctx.emit(Instruction::nullary(if ty == Type::Double { Opcode::DivF } else { Opcode::Div }));
            }
            BinOp::Lt => {
                ctx.emit(Instruction::nullary(cmp_op));
                ctx.emit(Instruction::nullary(Opcode::SetLt));
            }
            BinOp::Gt => {
                ctx.emit(Instruction::nullary(cmp_op));
                ctx.emit(Instruction::nullary(Opcode::SetGt));
            }
            // a <= b  ==  1 - (a > b)
            BinOp::Le => {
                ctx.emit(Instruction::nullary(cmp_op));
                ctx.emit(Instruction::nullary(Opcode::SetGt));
                Self::emit_bool_complement(ctx);
            }
            // a >= b  ==  1 - (a < b)
            BinOp::Ge => {
                ctx.emit(Instruction::nullary(cmp_op));
                ctx.emit(Instruction::nullary(Opcode::SetLt));
                Self::emit_bool_complement(ctx);
            }
            BinOp::Eq | BinOp::Ne => {
                let scratch = ctx.cmp_scratch.expect("scratch allocated when Eq/Ne was pushed");
                ctx.emit(Instruction::nullary(cmp_op));
                ctx.emit(Instruction::nullary(Opcode::Store));
                ctx.emit(Self::scratch_addr_instr(scratch));
                ctx.emit(Instruction::nullary(Opcode::Load));
                ctx.emit(Instruction::nullary(Opcode::SetLt));
                ctx.emit(Self::scratch_addr_instr(scratch));
                ctx.emit(Instruction::nullary(Opcode::Load));
                ctx.emit(Instruction::nullary(Opcode::SetGt));
                ctx.emit(Instruction::nullary(Opcode::Add));
                if op == BinOp::Eq {
                    Self::emit_bool_complement(ctx);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<(GlobalTable, FunctionTable), CompileError> {
        Analyzer::new(source).analyze()
    }

    #[test]
    fn simplest_program_produces_start_and_main() {
        let (_, funcs) = compile("fn main() -> void { return; }").unwrap();
        assert!(funcs.contains("main"));
        assert!(funcs.contains("_start"));
        assert_eq!(funcs.get("_start").unwrap().function_id, 0);
    }

    #[test]
    fn missing_main_is_reported() {
        let err = compile("fn helper() -> void { return; }").unwrap_err();
        assert!(matches!(err, CompileError::NoMain(_)));
    }

    #[test]
    fn undeclared_identifier_is_reported() {
        let err = compile("fn main() -> void { x = 1; return; }").unwrap_err();
        assert!(matches!(err, CompileError::NotDeclared(_)));
    }

    #[test]
    fn assigning_to_a_const_is_reported() {
        let src = "fn main() -> void { const x: int = 1; x = 2; return; }";
        let err = compile(src).unwrap_err();
        assert!(matches!(err, CompileError::AssignToConstant(_)));
    }

    #[test]
    fn break_outside_loop_is_reported() {
        let err = compile("fn main() -> void { break; return; }").unwrap_err();
        assert!(matches!(err, CompileError::NotWhile(_)));
    }

    #[test]
    fn non_void_function_without_return_is_reported() {
        let err = compile("fn f() -> int { let x: int = 1; }").unwrap_err();
        assert!(matches!(err, CompileError::NotValidReturn(_)));
    }

    #[test]
    fn while_loop_back_edge_targets_loop_top() {
        let src = "fn main() -> void { while 1 < 2 { } return; }";
        let (_, funcs) = compile(src).unwrap();
        let main = funcs.get("main").unwrap();
        let back_edge = main
            .instructions
            .iter()
            .enumerate()
            .find(|(_, i)| i.op == Opcode::Br && matches!(i.operand, Operand::I32(d) if d < 0))
            .expect("back edge branch present");
        if let Operand::I32(displacement) = back_edge.1.operand {
            let target = back_edge.0 as i32 + displacement;
            assert_eq!(target, 0);
        }
    }

    #[test]
    fn break_jumps_past_the_loop_not_back_into_it() {
        let src = "fn main() -> void { while 1 < 2 { break; } return; }";
        let (_, funcs) = compile(src).unwrap();
        let main = funcs.get("main").unwrap();
        // br instructions, in order: the while's own exit placeholder,
        // break's branch, and the loop's back edge. break must land past
        // the back edge, not inside the loop body it just exited.
        let brs: Vec<(usize, i32)> = main
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, i)| i.op == Opcode::Br)
            .map(|(i, instr)| match instr.operand {
                Operand::I32(d) => (i, d),
                _ => unreachable!("br always carries an i32 operand"),
            })
            .collect();
        assert_eq!(brs.len(), 3);
        let (break_idx, break_disp) = brs[1];
        let back_edge_idx = brs[2].0;
        let break_target = break_idx as i32 + break_disp;
        assert!(break_target as usize > back_edge_idx);
    }

    #[test]
    fn equality_comparison_compiles_without_duplicating_operand_evaluation() {
        let src = "fn main() -> void { if 1 == 2 { } return; }";
        let (_, funcs) = compile(src).unwrap();
        let main = funcs.get("main").unwrap();
        let push_count = main.instructions.iter().filter(|i| i.op == Opcode::Push).count();
        // two literal pushes (1, 2) plus the complement's `push 1`; never
        // re-evaluates either operand.
        assert_eq!(push_count, 3);
        assert_eq!(main.instructions.iter().filter(|i| i.op == Opcode::CmpI).count(), 1);
    }

    #[test]
    fn call_argument_count_mismatch_is_reported() {
        let src = "fn f(a: int) -> void { return; } fn main() -> void { f(); return; }";
        let err = compile(src).unwrap_err();
        assert!(matches!(err, CompileError::ParamError(_)));
    }

    #[test]
    fn string_literal_becomes_a_global_and_an_int_push() {
        let src = r#"fn main() -> void { putstr("hi"); return; }"#;
        let (globals, _) = compile(src).unwrap();
        assert!(globals.globals.iter().any(|g| g.value_bytes == b"hi".to_vec()));
    }
}
