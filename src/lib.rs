pub mod error;
pub mod config;
pub mod util;
pub mod message;
pub mod method;
pub mod call;
pub mod peer;
pub mod routing;
pub mod system;
pub mod object;
pub mod stream;
pub mod hub;
pub mod test_util;
