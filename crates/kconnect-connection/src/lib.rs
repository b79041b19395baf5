//! Kernel connection credentials: writing, reading, and finding connection
//! files, and the [`KernelConnection`] object that owns one kernel's
//! credentials and builds channel sockets from them.

mod file;
mod find;
mod kernel_connection;
mod socket;

pub use file::{read_connection_file, secure_write, write_connection_file};
pub use find::{
    RUNTIME_DIR_ENV, default_search_paths, find_connection_file, runtime_dir, runtime_dir_from,
};
pub use kernel_connection::{ConnectionSnapshot, KernelConnection, RandomPortSet, SessionAuth};
pub use socket::{SOCKET_LINGER_MS, connect_socket, socket_type};
