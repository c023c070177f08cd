pub mod codec;
pub mod error;
pub mod instance;
pub mod method;
pub mod value;

pub use codec::WideString;
pub use error::{Result, StoreError};
pub use instance::{ClassObject, Instance, MethodSignature, PATH_PROPERTY};
pub use method::Method;
pub use value::Variant;
