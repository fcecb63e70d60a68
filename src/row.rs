//! Public result types. A cell is either absent (`NULL`) or a raw byte
//! string; the core never infers a richer type than that.

use crate::constant::{ColumnFlags, ColumnType};
use crate::handle::StmtHandle;

pub type Cell = Option<Vec<u8>>;
pub type Row = Vec<Cell>;

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

#[derive(Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
}

/// One statement's worth of a response. A query produces exactly one of
/// these unless `Opts::multi_statements` is set and the SQL text contains
/// more than one `;`-separated statement.
#[derive(Debug)]
pub enum StatementResult {
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
        warnings: u16,
        info: String,
    },
    Rows(ResultSet),
}

/// What a `query`/`execute` callback receives: one entry per statement,
/// in order.
pub type QueryResult = Vec<StatementResult>;

#[derive(Debug)]
pub struct PreparedInfo {
    pub handle: StmtHandle,
    pub param_count: u16,
    pub columns: Vec<ColumnMeta>,
}
