// Protocol model
pub use jinglecore;
pub use jinglecore::{Candidate, Jid, SessionDescription};

pub mod calls;

#[cfg(test)]
pub(crate) mod test_utils;
