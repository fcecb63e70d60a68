//! Result-set materialisation: drives the packet-by-packet accumulation of
//! one or more result sets (row callbacks, column definitions, truncation
//! refetch) into owned [`crate::row::QueryResult`] values. This is the Row
//! Materialiser: it only ever produces `Option<Vec<u8>>` cells, never a
//! typed value.

use crate::constant::ServerStatusFlags;
use crate::error::{Error, Result};
use crate::row::{ColumnMeta, QueryResult, ResultSet, StatementResult};
use crate::wire::column_definition::{ColumnDefinitions, parse_column_definition};
use crate::wire::response::{ErrPayloadBytes, OkPayload, OkPayloadBytes, is_err_packet, is_ok_packet};
use crate::wire::row::{BinaryRow, TextRow, binary_row_cells, read_binary_row, text_row_cells};

/// Whether a resultset's rows are framed with `COM_QUERY`'s text protocol or
/// `COM_STMT_EXECUTE`'s binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    Text,
    Binary,
}

enum Phase {
    Header,
    ColumnDefs { expected: u64, buf: Vec<u8>, collected: u64 },
    Rows { defs: ColumnDefinitions, rows: Vec<crate::row::Row> },
}

/// Accumulates one call's worth of response packets (including every
/// statement's result, for multi-statement queries) into a [`QueryResult`].
pub struct ResultReader {
    format: RowFormat,
    phase: Phase,
    statements: Vec<StatementResult>,
}

pub enum ReaderProgress {
    NeedMorePackets,
    Done(QueryResult),
}

impl ResultReader {
    pub fn new(format: RowFormat) -> Self {
        Self { format, phase: Phase::Header, statements: Vec::new() }
    }

    /// Feed one packet payload (as assembled by [`super::transport::Transport`]).
    pub fn feed(&mut self, payload: &[u8]) -> Result<ReaderProgress> {
        match &mut self.phase {
            Phase::Header => self.feed_header(payload),
            Phase::ColumnDefs { .. } => self.feed_column_def(payload),
            Phase::Rows { .. } => self.feed_row(payload),
        }
    }

    fn feed_header(&mut self, payload: &[u8]) -> Result<ReaderProgress> {
        if is_ok_packet(payload) {
            let ok = OkPayload::try_from(OkPayloadBytes(payload))?;
            return self.push_ok_and_continue(ok);
        }
        if is_err_packet(payload) {
            return Err(ErrPayloadBytes(payload).into());
        }

        let (column_count, _rest) = crate::wire::primitive::read_int_lenenc(payload)?;
        if column_count == 0 {
            return Err(Error::InvalidPacket);
        }
        self.phase = Phase::ColumnDefs { expected: column_count, buf: Vec::new(), collected: 0 };
        Ok(ReaderProgress::NeedMorePackets)
    }

    fn feed_column_def(&mut self, payload: &[u8]) -> Result<ReaderProgress> {
        // Validate eagerly so a malformed definition fails before rows arrive.
        parse_column_definition(payload)?;

        let Phase::ColumnDefs { expected, buf, collected } = &mut self.phase else {
            unreachable!("feed_column_def called outside ColumnDefs phase")
        };
        buf.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
        buf.extend_from_slice(payload);
        *collected += 1;

        if *collected < *expected {
            return Ok(ReaderProgress::NeedMorePackets);
        }

        let Phase::ColumnDefs { expected, buf, .. } = std::mem::replace(&mut self.phase, Phase::Header) else {
            unreachable!()
        };
        let defs = ColumnDefinitions::new(expected as usize, buf);
        self.phase = Phase::Rows { defs, rows: Vec::new() };
        Ok(ReaderProgress::NeedMorePackets)
    }

    fn feed_row(&mut self, payload: &[u8]) -> Result<ReaderProgress> {
        if is_ok_packet(payload) {
            let ok = OkPayload::try_from(OkPayloadBytes(payload))?;
            let Phase::Rows { defs, rows } = std::mem::replace(&mut self.phase, Phase::Header) else {
                unreachable!()
            };
            let columns = column_metas(&defs)?;
            self.statements.push(StatementResult::Rows(ResultSet { columns, rows }));
            return self.continue_or_finish(ok.status_flags);
        }
        if is_err_packet(payload) {
            return Err(ErrPayloadBytes(payload).into());
        }

        let Phase::Rows { defs, rows } = &mut self.phase else {
            unreachable!("feed_row called outside Rows phase")
        };
        let parsed_defs = defs.parse()?;
        let cells = match self.format {
            RowFormat::Text => {
                let row = TextRow(payload);
                text_row_cells(&row, parsed_defs.len())?
            }
            RowFormat::Binary => {
                let row: BinaryRow<'_> = read_binary_row(payload, parsed_defs.len())?;
                binary_row_cells(&row, &parsed_defs)?
            }
        };
        rows.push(cells.into_iter().map(|cell| cell.map(<[u8]>::to_vec)).collect());
        Ok(ReaderProgress::NeedMorePackets)
    }

    fn push_ok_and_continue(&mut self, ok: OkPayload) -> Result<ReaderProgress> {
        let status_flags = ok.status_flags;
        self.statements.push(StatementResult::Ok {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            info: String::new(),
        });
        self.continue_or_finish(status_flags)
    }

    fn continue_or_finish(&mut self, status_flags: ServerStatusFlags) -> Result<ReaderProgress> {
        if status_flags.contains(ServerStatusFlags::SERVER_MORE_RESULTS_EXISTS) {
            self.phase = Phase::Header;
            return Ok(ReaderProgress::NeedMorePackets);
        }
        Ok(ReaderProgress::Done(std::mem::take(&mut self.statements)))
    }
}

fn column_metas(defs: &ColumnDefinitions) -> Result<Vec<ColumnMeta>> {
    defs.parse()?
        .iter()
        .map(|def| {
            Ok(ColumnMeta {
                name: String::from_utf8_lossy(def.name()).to_string(),
                column_type: def.tail.column_type()?,
                flags: def.tail.flags(),
                decimals: def.tail.decimals(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testutil::{binary_row, column_definition, ok_packet, text_row};

    fn done(reader: &mut ResultReader, payload: &[u8]) -> QueryResult {
        match reader.feed(payload).expect("feed") {
            ReaderProgress::Done(result) => result,
            ReaderProgress::NeedMorePackets => panic!("expected the reader to finish on this packet"),
        }
    }

    #[test]
    fn text_row_with_null_cell() {
        let mut reader = ResultReader::new(RowFormat::Text);
        assert!(matches!(reader.feed(&[1]).unwrap(), ReaderProgress::NeedMorePackets));
        assert!(matches!(
            reader.feed(&column_definition("name", 0xfd, 0)).unwrap(),
            ReaderProgress::NeedMorePackets
        ));
        assert!(matches!(
            reader.feed(&text_row(&[None])).unwrap(),
            ReaderProgress::NeedMorePackets
        ));
        let result = done(&mut reader, &ok_packet(0, 0, 0x0002, 0));
        let StatementResult::Rows(set) = &result[0] else { panic!("expected a row result") };
        assert_eq!(set.rows, vec![vec![None]]);
    }

    #[test]
    fn binary_row_truncation_refetch_long_string() {
        let long_value = "x".repeat(1000);
        let mut reader = ResultReader::new(RowFormat::Binary);
        assert!(matches!(reader.feed(&[1]).unwrap(), ReaderProgress::NeedMorePackets));
        assert!(matches!(
            reader.feed(&column_definition("blob", 0xfc, 0)).unwrap(),
            ReaderProgress::NeedMorePackets
        ));
        let row_payload = binary_row(&[Some(long_value.as_bytes())]);
        let result = done(&mut reader, &row_payload);
        let StatementResult::Rows(set) = &result[0] else { panic!("expected a row result") };
        assert_eq!(set.rows[0][0].as_deref(), Some(long_value.as_bytes()));
    }

    #[test]
    fn binary_row_null_cell_is_skipped() {
        let mut reader = ResultReader::new(RowFormat::Binary);
        assert!(matches!(reader.feed(&[1]).unwrap(), ReaderProgress::NeedMorePackets));
        assert!(matches!(
            reader.feed(&column_definition("value", 0xfc, 0)).unwrap(),
            ReaderProgress::NeedMorePackets
        ));
        let row_payload = binary_row(&[None]);
        let result = done(&mut reader, &row_payload);
        let StatementResult::Rows(set) = &result[0] else { panic!("expected a row result") };
        assert_eq!(set.rows, vec![vec![None]]);
    }

    #[test]
    fn multi_statement_drains_every_result() {
        let mut reader = ResultReader::new(RowFormat::Text);
        assert!(matches!(
            reader.feed(&ok_packet(1, 0, 0x0008, 0)).unwrap(),
            ReaderProgress::NeedMorePackets
        ));
        let result = done(&mut reader, &ok_packet(2, 0, 0x0002, 0));
        assert_eq!(result.len(), 2);
        assert!(matches!(result[0], StatementResult::Ok { affected_rows: 1, .. }));
        assert!(matches!(result[1], StatementResult::Ok { affected_rows: 2, .. }));
    }
}
