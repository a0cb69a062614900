use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("instruction address {0:#x} is not word aligned")]
    Misaligned(u32),
    #[error("instruction at {0:#x} lies outside the code image")]
    OutOfImage(u32),
    #[error("entry point {0:#x} lies outside the code image")]
    EntryOutsideImage(u32),
}
