// HTTP routes
pub mod debug;
pub mod health;
pub mod stream;
pub mod upload;

pub use debug::*;
pub use health::*;
pub use stream::*;
pub use upload::*;
