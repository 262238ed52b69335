//! Decryption collaborator for encrypted executables
//!
//! No keys ship with the loader. Front-ends that have a decryption engine
//! plug it in through [`Decryptor`].

use ag_core::error::LoaderError;
use tracing::debug;

/// Decrypts a `~PSP` image into a plain ELF
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, LoaderError>;
}

/// Decryptor used when no engine is configured; always fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeysDecryptor;

impl Decryptor for NoKeysDecryptor {
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, LoaderError> {
        debug!("No decryption engine configured for {} byte image", data.len());
        Err(LoaderError::DecryptionFailed("no decryption keys available".to_string()))
    }
}

impl<F> Decryptor for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, LoaderError> + Send + Sync,
{
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, LoaderError> {
        self(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_keys() {
        let result = NoKeysDecryptor.decrypt(b"~PSP");
        assert!(matches!(result, Err(LoaderError::DecryptionFailed(_))));
    }

    #[test]
    fn test_closure_decryptor() {
        let strip = |data: &[u8]| -> Result<Vec<u8>, LoaderError> { Ok(data[4..].to_vec()) };
        let boxed: Box<dyn Decryptor> = Box::new(strip);
        assert_eq!(boxed.decrypt(b"~PSPbody").unwrap(), b"body");
    }
}
