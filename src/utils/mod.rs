pub mod cancel;
pub mod file;
pub mod hash;
