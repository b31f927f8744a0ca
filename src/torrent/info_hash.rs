use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct InfoHash([u8; Self::INFO_HASH_SIZE]);
impl InfoHash {
    pub const INFO_HASH_SIZE: usize = sha1_smol::DIGEST_LENGTH;
}

impl InfoHash {
    pub fn new(bytes: [u8; Self::INFO_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn of(bytes: &[u8]) -> Self {
        Self(sha1_smol::Sha1::from(bytes).digest().bytes())
    }
}

impl AsRef<[u8; Self::INFO_HASH_SIZE]> for InfoHash {
    fn as_ref(&self) -> &[u8; Self::INFO_HASH_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}
