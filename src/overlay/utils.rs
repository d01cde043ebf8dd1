/// O_DIRECT requires I/O from block-aligned memory; incoming write
/// payloads carry no alignment guarantee, so they are copied through
/// one of these before the pwrite.
const BLOCK: usize = 4096;

#[derive(Clone)]
#[repr(align(4096))]
struct AlignedBlock([u8; BLOCK]);

pub(crate) struct AlignedBuf {
    blocks: Vec<AlignedBlock>,
    len: usize,
}

impl AlignedBuf {
    pub fn copy_of(data: &[u8]) -> Self {
        let nblocks = data.len().div_ceil(BLOCK).max(1);
        let mut blocks = vec![AlignedBlock([0u8; BLOCK]); nblocks];
        for (i, chunk) in data.chunks(BLOCK).enumerate() {
            blocks[i].0[..chunk.len()].copy_from_slice(chunk);
        }
        AlignedBuf {
            blocks,
            len: data.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `blocks` is a live contiguous allocation of
        // `blocks.len() * BLOCK` initialised bytes and `len` never
        // exceeds that, so the view stays in bounds for self's lifetime.
        unsafe { std::slice::from_raw_parts(self.blocks.as_ptr() as *const u8, self.len) }
    }
}
