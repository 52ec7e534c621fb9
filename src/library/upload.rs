use crate::library::error::SpeedTestError;
use bytes::Bytes;
use tracing::info;

/// One immutable payload shared by every upload stream of a phase.
/// Freed when the last stream holding a clone is dropped.
#[derive(Debug, Clone)]
pub struct UploadBuffer {
    data: Bytes,
}

impl UploadBuffer {
    pub fn generate(size: usize) -> Result<UploadBuffer, SpeedTestError> {
        if size == 0 {
            return Err(SpeedTestError::InvalidUploadSize);
        }
        let mut data: Vec<u8> = Vec::new();
        data.try_reserve_exact(size).map_err(|err| {
            SpeedTestError::ResourceExhaustion(format!(
                "failed to allocate {size} bytes of upload data: {err}"
            ))
        })?;
        // Deterministic filler: byte i is i mod 256.
        data.extend((0..size).map(|i| i as u8));
        info!("Generated {} bytes of upload data", size);
        Ok(UploadBuffer {
            data: Bytes::from(data),
        })
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A fresh cursor over the whole buffer.
    pub fn stream(&self) -> UploadStream {
        UploadStream {
            data: self.data.clone(),
            cursor: 0,
        }
    }
}

#[derive(Debug)]
pub struct UploadStream {
    data: Bytes,
    cursor: usize,
}

impl UploadStream {
    /// Copy up to `dst.len()` bytes and advance. Returns 0 once everything went out.
    pub fn pull(&mut self, dst: &mut [u8]) -> usize {
        let remaining: &[u8] = &self.data[self.cursor..];
        let n: usize = dst.len().min(remaining.len());
        dst[..n].copy_from_slice(&remaining[..n]);
        self.cursor += n;
        n
    }

    #[inline(always)]
    pub fn sent(&self) -> usize {
        self.cursor
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
