pub mod client;
pub mod connector;
pub mod constant;
pub mod error;
mod handle;
mod lifecycle;
pub mod opts;
mod pipeline;
mod queues;
pub mod row;
mod state;
pub mod watcher;
pub mod wire;

pub use client::Client;
pub use error::{Error, Result};
pub use handle::StmtHandle;
pub use opts::Opts;
pub use row::{ColumnMeta, QueryResult, ResultSet, StatementResult};
