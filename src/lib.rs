mod meta_lib;

pub use meta_lib::*;
