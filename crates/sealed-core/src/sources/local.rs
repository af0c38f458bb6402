//! Local cryptographically secure generator.

use async_trait::async_trait;

use crate::error::EntropyError;
use crate::source::{EntropySource, RawByteBatch, SourceKind};

/// Bytes straight from the OS CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSecureSource;

impl LocalSecureSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EntropySource for LocalSecureSource {
    fn kind(&self) -> SourceKind {
        SourceKind::LocalSecure
    }

    async fn fetch(&self, n: usize) -> Result<RawByteBatch, EntropyError> {
        if n == 0 {
            return Err(EntropyError::InvalidRequest("zero bytes requested".into()));
        }
        let mut bytes = vec![0u8; n];
        getrandom::fill(&mut bytes)?;
        Ok(RawByteBatch::new(SourceKind::LocalSecure, "os-csprng", bytes))
    }
}
