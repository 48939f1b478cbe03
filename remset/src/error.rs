use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    InvalidSettings(&'static str),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSettings(reason) => {
                write!(f, "invalid store buffer settings: {reason}")
            }
        }
    }
}

impl std::error::Error for SetupError {}

/// Terminates the process. Running out of store buffer space means the
/// collector can no longer find every old-to-young pointer.
#[cold]
#[inline(never)]
pub fn fatal_out_of_memory(location: &str) -> ! {
    log::error!("fatal process out of memory: {location}");
    eprintln!("fatal process out of memory: {location}");
    std::process::abort()
}
