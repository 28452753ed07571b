//! Process-wide helpers shared by the CSE binaries: logging setup and the
//! build version string.

pub mod logging;
pub mod version;
