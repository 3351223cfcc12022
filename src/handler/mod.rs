pub mod stream;
pub mod system;
