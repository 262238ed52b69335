//! Error types for the allegrex module loader

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

/// Memory-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Invalid address: 0x{0:08x}")]
    InvalidAddress(u32),

    #[error("Alignment error: address 0x{addr:08x} not aligned to {align}")]
    AlignmentError { addr: u32, align: u32 },
}

/// Loader errors
///
/// Only conditions that abort the load of a single module are errors.
/// Truncated segments, unknown relocations, allocation mismatches and
/// unresolved imports are reported through `tracing` and loading continues.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Unrecognized file format (magic {:02X} {:02X} {:02X} {:02X})", magic[0], magic[1], magic[2], magic[3])]
    UnrecognizedFormat { magic: [u8; 4] },

    #[error("Not an executable file: {0}")]
    NotExecutable(String),

    #[error("No data to load")]
    Empty,

    #[error("Encrypted file not supported: {0}")]
    UnsupportedEncryption(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid ELF: {0}")]
    InvalidElf(String),

    #[error("Not a MIPS executable (e_machine={0})")]
    NotMips(u16),

    #[error("Module info not found")]
    ModuleInfoMissing,

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EmulatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::InvalidAddress(0x12345678);
        assert_eq!(format!("{}", err), "Invalid address: 0x12345678");

        let err = MemoryError::AlignmentError { addr: 0x0880_0002, align: 4 };
        assert_eq!(
            format!("{}", err),
            "Alignment error: address 0x08800002 not aligned to 4"
        );

        let err = LoaderError::UnrecognizedFormat { magic: [0xDE, 0xAD, 0xBE, 0xEF] };
        assert_eq!(
            format!("{}", err),
            "Unrecognized file format (magic DE AD BE EF)"
        );
    }

    #[test]
    fn test_error_conversion() {
        let mem_err = MemoryError::InvalidAddress(0);
        let loader_err: LoaderError = mem_err.into();
        assert!(matches!(loader_err, LoaderError::Memory(MemoryError::InvalidAddress(0))));

        let emu_err: EmulatorError = loader_err.into();
        assert!(matches!(emu_err, EmulatorError::Loader(LoaderError::Memory(_))));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let emu_err: EmulatorError = io_err.into();
        assert!(matches!(emu_err, EmulatorError::Io(_)));
    }
}
