mod cookie;
mod error;
mod origin;

pub use cookie::Cookie;
pub use error::{ErrorKind, Result};
pub use origin::Origin;
