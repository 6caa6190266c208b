pub mod test_fixtures;

#[allow(unused_imports)]
pub use test_fixtures::*;
