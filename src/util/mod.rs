//! Small shared helpers with no I/O.

pub(crate) mod aspect;
pub(crate) mod thumbhash;
