pub mod codec;
pub mod object_server;
pub mod protocol;
pub mod proxy;
pub mod transport;

pub use object_server::{ObjectRegistry, ObjectServer, RemoteCall, RemoteObject};
pub use protocol::{Fault, ObjectHandle};
pub use proxy::{Proxy, RemoteMethod};
