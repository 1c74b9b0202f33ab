//! Single-pass compiler for the omc source language: lexes, analyzes, and
//! emits a big-endian bytecode image for an external stack-based VM.
//!
//! The pipeline is a straight line with no intermediate AST:
//! [`Analyzer`] drives the lexer token-by-token, resolves symbols, and emits
//! [`bytecode::Instruction`]s as it goes; [`assembler::assemble`] then
//! serializes the resulting globals and functions into the image format.

pub mod analyzer;
pub mod assembler;
pub mod bytecode;
pub mod cursor;
pub mod error;
pub mod lexer;
pub mod precedence;
pub mod symbols;
pub mod token_buffer;

use std::fs;
use std::path::Path;

pub use analyzer::Analyzer;
pub use error::CompileError;

/// Compile source text straight to a serialized image, with no filesystem
/// involvement. The entry point integration tests drive.
pub fn compile_source(source: &str) -> Result<Vec<u8>, CompileError> {
    let (globals, functions) = Analyzer::new(source).analyze()?;
    Ok(assembler::assemble(&globals, &functions))
}

/// Analyze source text without assembling an image, for `omc check`.
pub fn check_source(source: &str) -> Result<(), CompileError> {
    Analyzer::new(source).analyze().map(|_| ())
}

/// Read `input`, compile it, and write the image to `output`.
pub fn compile_file(input: &Path, output: &Path) -> Result<(), CompileErrorOrIo> {
    let source = fs::read_to_string(input).map_err(CompileErrorOrIo::Io)?;
    let image = compile_source(&source).map_err(CompileErrorOrIo::Compile)?;
    fs::write(output, image).map_err(CompileErrorOrIo::Io)?;
    Ok(())
}

/// Read and analyze `input` without producing an output file, for `omc check`.
pub fn check_file(input: &Path) -> Result<(), CompileErrorOrIo> {
    let source = fs::read_to_string(input).map_err(CompileErrorOrIo::Io)?;
    check_source(&source).map_err(CompileErrorOrIo::Compile)
}

/// Wraps the two ways a file-based entry point can fail: the error itself
/// doesn't carry a position, since `std::io::Error` isn't one of the
/// language's error kinds.
#[derive(Debug, thiserror::Error)]
pub enum CompileErrorOrIo {
    #[error("{0}")]
    Compile(#[from] CompileError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_the_simplest_program_to_a_well_formed_image() {
        let image = compile_source("fn main() -> void { return; }").unwrap();
        assert_eq!(&image[0..4], &0x72303b3e_u32.to_be_bytes());
        assert_eq!(&image[4..8], &0x0000_0001_u32.to_be_bytes());
    }

    #[test]
    fn check_reports_the_same_errors_as_compile() {
        let err = check_source("fn oops() -> void { return 1; }").unwrap_err();
        assert!(matches!(err, CompileError::NotValidReturn(_)));
    }
}
