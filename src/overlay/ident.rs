use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// 128-bit identity of a filesystem object, rendered as 32 lowercase hex
/// digits on disk (in the id xattr and as the backing entry name).
///
/// Ids are minted once at create time and survive rename and link; the
/// backing entry for an object lives at `<layer-root>/<id>` on every layer
/// that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; 16]);

/// Identity of the root directory. Pre-created under the top layer at
/// mount time and pinned to node handle 1.
pub const ROOT_ID: ObjectId = ObjectId([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01,
]);

impl ObjectId {
    pub fn new_v4() -> Self {
        ObjectId(*Uuid::new_v4().as_bytes())
    }

    /// Parse the 32-hex on-disk rendering (as read back from an id xattr).
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_val(chunk[0])?;
            let lo = hex_val(chunk[1])?;
            out[i] = (hi << 4) | lo;
        }
        Some(ObjectId(out))
    }

    pub fn is_root(&self) -> bool {
        *self == ROOT_ID
    }

    /// The 64-bit inode number reported to the kernel: the low half of the
    /// id, big-endian. The root id maps to 1. The 128 -> 64 bit truncation
    /// can collide in principle; the st_ino space simply is that small.
    pub fn to_ino(&self) -> u64 {
        if self.is_root() {
            return 1;
        }
        u64::from_be_bytes(self.0[8..16].try_into().unwrap())
    }

    /// On-disk rendering, also used as the backing entry name.
    pub fn hex(&self) -> String {
        self.to_string()
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for ObjectId {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        ObjectId::parse(s.as_bytes()).ok_or(())
    }
}
