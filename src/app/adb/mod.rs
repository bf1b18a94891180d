pub mod apk;
pub mod locator;
pub mod packages;
pub mod parse;
pub mod runner;
pub mod transport;
