use crate::frame::frame_errors::{
    ColumnSpecParseErrorKind, CqlResultParseError, CqlTypeParseError, LowLevelDeserializationError,
    ResultMetadataParseError, RowsParseError,
};
use crate::frame::request::query::PagingStateResponse;
use crate::frame::types;
use bytes::{BufMut, Bytes};
use std::result::Result as StdResult;
use std::sync::Arc;

// Result kinds
const RESULT_VOID: i32 = 0x0001;
const RESULT_ROWS: i32 = 0x0002;
const RESULT_SET_KEYSPACE: i32 = 0x0003;
const RESULT_PREPARED: i32 = 0x0004;
const RESULT_SCHEMA_CHANGE: i32 = 0x0005;

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;
const FLAG_CONTINUOUS_PAGING: i32 = 0x4000_0000;
const FLAG_LAST_CONTINUOUS_PAGE: i32 = i32::MIN; // 0x8000_0000

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

/// A schema change result. Its payload is not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    ks_name: String,
    table_name: String,
}

impl TableSpec {
    pub fn new(ks_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            ks_name: ks_name.into(),
            table_name: table_name.into(),
        }
    }

    pub fn ks_name(&self) -> &str {
        &self.ks_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    table_spec: TableSpec,
    name: String,
    typ: ColumnType,
}

impl ColumnSpec {
    #[inline]
    pub fn new(name: impl Into<String>, typ: ColumnType, table_spec: TableSpec) -> Self {
        Self {
            table_spec,
            name: name.into(),
            typ,
        }
    }

    #[inline]
    pub fn table_spec(&self) -> &TableSpec {
        &self.table_spec
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn typ(&self) -> &ColumnType {
        &self.typ
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    col_count: usize,
    col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    /// Metadata describing the given columns.
    pub fn new(col_specs: Vec<ColumnSpec>) -> Self {
        Self {
            col_count: col_specs.len(),
            col_specs,
        }
    }

    #[inline]
    pub fn col_count(&self) -> usize {
        self.col_count
    }

    /// Column specs, empty if the server skipped the metadata.
    #[inline]
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }
}

/// Position of a page within a continuous paging stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuousPageInfo {
    /// 1-based sequence number of the page.
    pub page_number: i32,
    /// Whether the server will send no page after this one.
    pub last: bool,
}

/// A single row, with cells kept in their serialized form.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Bytes>>,
}

#[derive(Debug, Clone)]
pub struct Rows {
    pub metadata: Arc<ResultMetadata>,
    pub paging_state_response: PagingStateResponse,
    /// Present on pages of a continuous paging stream.
    pub continuous_page: Option<ContinuousPageInfo>,
    pub rows_count: usize,
    pub rows: Vec<Row>,
    /// Original size of the serialized rows.
    pub serialized_size: usize,
}

#[derive(Debug, Clone)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    SchemaChange(SchemaChange),
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, CqlTypeParseError> {
    use ColumnType::*;
    let id =
        types::read_short(buf).map_err(|err| CqlTypeParseError::TypeIdParseError(err.into()))?;
    Ok(match id {
        0x0000 => {
            let type_str =
                types::read_string(buf).map_err(CqlTypeParseError::CustomTypeNameParseError)?;
            match type_str {
                "org.apache.cassandra.db.marshal.DurationType" => Duration,
                _ => Custom(type_str.to_owned()),
            }
        }
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace_name = types::read_string(buf)
                .map_err(CqlTypeParseError::UdtNameParseError)?
                .to_owned();
            let type_name = types::read_string(buf)
                .map_err(CqlTypeParseError::UdtNameParseError)?
                .to_owned();
            let fields_size: usize = types::read_short(buf)
                .map_err(|err| CqlTypeParseError::UdtFieldParseError(err.into()))?
                .into();

            let mut field_types = Vec::with_capacity(fields_size);
            for _ in 0..fields_size {
                let field_name = types::read_string(buf)
                    .map_err(CqlTypeParseError::UdtFieldParseError)?
                    .to_owned();
                let field_type = deser_type(buf)?;
                field_types.push((field_name, field_type));
            }

            UserDefinedType {
                type_name,
                keyspace: keyspace_name,
                field_types,
            }
        }
        0x0031 => {
            let len: usize = types::read_short(buf)
                .map_err(|err| CqlTypeParseError::TupleLengthParseError(err.into()))?
                .into();
            let mut types = Vec::with_capacity(len);
            for _ in 0..len {
                types.push(deser_type(buf)?);
            }
            Tuple(types)
        }
        id => {
            return Err(CqlTypeParseError::TypeNotImplemented(id));
        }
    })
}

fn ser_type(typ: &ColumnType, buf: &mut impl BufMut) -> StdResult<(), std::num::TryFromIntError> {
    use ColumnType::*;
    let id: u16 = match typ {
        Custom(name) => {
            types::write_short(0x0000, buf);
            return types::write_string(name, buf);
        }
        Ascii => 0x0001,
        BigInt => 0x0002,
        Blob => 0x0003,
        Boolean => 0x0004,
        Counter => 0x0005,
        Decimal => 0x0006,
        Double => 0x0007,
        Float => 0x0008,
        Int => 0x0009,
        Timestamp => 0x000B,
        Uuid => 0x000C,
        Text => 0x000D,
        Varint => 0x000E,
        Timeuuid => 0x000F,
        Inet => 0x0010,
        Date => 0x0011,
        Time => 0x0012,
        SmallInt => 0x0013,
        TinyInt => 0x0014,
        Duration => 0x0015,
        List(elem) | Set(elem) => {
            types::write_short(if matches!(typ, List(_)) { 0x0020 } else { 0x0022 }, buf);
            return ser_type(elem, buf);
        }
        Map(key, value) => {
            types::write_short(0x0021, buf);
            ser_type(key, buf)?;
            return ser_type(value, buf);
        }
        UserDefinedType {
            type_name,
            keyspace,
            field_types,
        } => {
            types::write_short(0x0030, buf);
            types::write_string(keyspace, buf)?;
            types::write_string(type_name, buf)?;
            types::write_short(u16::try_from(field_types.len())?, buf);
            for (name, field_type) in field_types {
                types::write_string(name, buf)?;
                ser_type(field_type, buf)?;
            }
            return Ok(());
        }
        Tuple(elems) => {
            types::write_short(0x0031, buf);
            types::write_short(u16::try_from(elems.len())?, buf);
            for elem in elems {
                ser_type(elem, buf)?;
            }
            return Ok(());
        }
    };
    types::write_short(id, buf);
    Ok(())
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn mk_col_spec_parse_error(
    column_index: usize,
    kind: impl Into<ColumnSpecParseErrorKind>,
) -> ResultMetadataParseError {
    ResultMetadataParseError::ColumnSpecParseError {
        column_index,
        kind: kind.into(),
    }
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ResultMetadataParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for col_idx in 0..col_count {
        let table_spec = match global_table_spec {
            Some(ref spec) => spec.clone(),
            None => deser_table_spec(buf).map_err(|err| {
                mk_col_spec_parse_error(col_idx, ColumnSpecParseErrorKind::TableSpecParseError(err))
            })?,
        };
        let name = types::read_string(buf)
            .map_err(|err| {
                mk_col_spec_parse_error(col_idx, ColumnSpecParseErrorKind::ColumnNameParseError(err))
            })?
            .to_owned();
        let typ = deser_type(buf).map_err(|err| mk_col_spec_parse_error(col_idx, err))?;
        col_specs.push(ColumnSpec::new(name, typ, table_spec));
    }
    Ok(col_specs)
}

struct RowsHeader<'a> {
    flags: i32,
    col_count: usize,
    raw_paging_state: Option<&'a [u8]>,
    continuous_page: Option<ContinuousPageInfo>,
}

fn deser_rows_header<'a>(buf: &mut &'a [u8]) -> StdResult<RowsHeader<'a>, ResultMetadataParseError> {
    let flags = types::read_int(buf)
        .map_err(|err| ResultMetadataParseError::FlagsParseError(err.into()))?;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;

    let col_count =
        types::read_int_length(buf).map_err(ResultMetadataParseError::ColumnCountParseError)?;

    let raw_paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map_err(ResultMetadataParseError::PagingStateParseError))
        .transpose()?;

    let continuous_page = if flags & FLAG_CONTINUOUS_PAGING != 0 {
        let page_number = types::read_int(buf).map_err(|err| {
            ResultMetadataParseError::ContinuousPageNumberParseError(err.into())
        })?;
        Some(ContinuousPageInfo {
            page_number,
            last: flags & FLAG_LAST_CONTINUOUS_PAGE != 0,
        })
    } else {
        None
    };

    Ok(RowsHeader {
        flags,
        col_count,
        raw_paging_state,
        continuous_page,
    })
}

fn deser_result_metadata(
    buf: &mut &[u8],
) -> StdResult<(ResultMetadata, PagingStateResponse, Option<ContinuousPageInfo>), ResultMetadataParseError>
{
    let header = deser_rows_header(buf)?;
    let paging_state = PagingStateResponse::new_from_raw_bytes(header.raw_paging_state);

    let col_specs = if header.flags & FLAG_NO_METADATA != 0 {
        vec![]
    } else {
        let global_table_spec = (header.flags & FLAG_GLOBAL_TABLES_SPEC != 0)
            .then(|| deser_table_spec(buf))
            .transpose()
            .map_err(ResultMetadataParseError::GlobalTableSpecParseError)?;

        deser_col_specs(buf, global_table_spec, header.col_count)?
    };

    let metadata = ResultMetadata {
        col_count: header.col_count,
        col_specs,
    };
    Ok((metadata, paging_state, header.continuous_page))
}

fn deser_rows(buf_bytes: Bytes) -> StdResult<Rows, RowsParseError> {
    let buf = &mut &*buf_bytes;
    let (metadata, paging_state_response, continuous_page) = deser_result_metadata(buf)?;

    let original_size = buf.len();

    let rows_count: usize =
        types::read_int_length(buf).map_err(RowsParseError::RowsCountParseError)?;

    let col_count = metadata.col_count;
    let mut rows = Vec::with_capacity(rows_count);
    for row_index in 0..rows_count {
        let mut columns = Vec::with_capacity(col_count);
        for column_index in 0..col_count {
            let cell = types::read_bytes_opt(buf).map_err(|err| RowsParseError::CellParseError {
                row_index,
                column_index,
                err,
            })?;
            columns.push(cell.map(|cell| buf_bytes.slice_ref(cell)));
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata: Arc::new(metadata),
        paging_state_response,
        continuous_page,
        rows_count,
        rows,
        serialized_size: original_size - buf.len(),
    })
}

pub fn deserialize(buf_bytes: Bytes) -> StdResult<Result, CqlResultParseError> {
    let buf = &mut &*buf_bytes;
    use self::Result::*;
    Ok(
        match types::read_int(buf)
            .map_err(|err| CqlResultParseError::ResultIdParseError(err.into()))?
        {
            RESULT_VOID => Void,
            RESULT_ROWS => Rows(deser_rows(buf_bytes.slice_ref(buf))?),
            RESULT_SET_KEYSPACE => SetKeyspace(self::SetKeyspace {
                keyspace_name: types::read_string(buf)
                    .map_err(CqlResultParseError::SetKeyspaceParseError)?
                    .to_owned(),
            }),
            RESULT_PREPARED => return Err(CqlResultParseError::PreparedUnsupported),
            RESULT_SCHEMA_CHANGE => SchemaChange(self::SchemaChange {
                body: buf_bytes.slice_ref(buf),
            }),
            id => return Err(CqlResultParseError::UnknownResultId(id)),
        },
    )
}

/// Reads only as much of a RESULT body as needed to tell which continuous page it carries.
///
/// Returns `None` for results that are not continuous pages.
pub fn peek_continuous_page(
    mut buf: &[u8],
) -> StdResult<Option<ContinuousPageInfo>, CqlResultParseError> {
    let buf = &mut buf;
    let kind = types::read_int(buf)
        .map_err(|err| CqlResultParseError::ResultIdParseError(err.into()))?;
    if kind != RESULT_ROWS {
        return Ok(None);
    }
    let header = deser_rows_header(buf).map_err(RowsParseError::from)?;
    Ok(header.continuous_page)
}

impl Rows {
    /// Writes the rows in their wire form, result kind included. Used by test servers.
    ///
    /// Column specs are written with a global table spec taken from the first column.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), std::num::TryFromIntError> {
        types::write_int(RESULT_ROWS, buf);

        let col_specs = self.metadata.col_specs();
        let raw_paging_state = match &self.paging_state_response {
            PagingStateResponse::HasMorePages { state } => state.as_bytes_slice().cloned(),
            PagingStateResponse::NoMorePages => None,
        };

        let mut flags = 0;
        if col_specs.is_empty() {
            flags |= FLAG_NO_METADATA;
        } else {
            flags |= FLAG_GLOBAL_TABLES_SPEC;
        }
        if raw_paging_state.is_some() {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        if let Some(page) = self.continuous_page {
            flags |= FLAG_CONTINUOUS_PAGING;
            if page.last {
                flags |= FLAG_LAST_CONTINUOUS_PAGE;
            }
        }

        types::write_int(flags, buf);
        types::write_int(i32::try_from(self.metadata.col_count())?, buf);
        if let Some(raw) = &raw_paging_state {
            types::write_bytes(raw, buf)?;
        }
        if let Some(page) = self.continuous_page {
            types::write_int(page.page_number, buf);
        }
        if let Some(first) = col_specs.first() {
            types::write_string(first.table_spec.ks_name(), buf)?;
            types::write_string(first.table_spec.table_name(), buf)?;
            for spec in col_specs {
                types::write_string(spec.name(), buf)?;
                ser_type(spec.typ(), buf)?;
            }
        }

        types::write_int(i32::try_from(self.rows.len())?, buf);
        for row in &self.rows {
            for cell in &row.columns {
                types::write_bytes_opt(cell.as_ref(), buf)?;
            }
        }
        Ok(())
    }
}

impl SetKeyspace {
    /// Writes the result in its wire form, result kind included.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), std::num::TryFromIntError> {
        types::write_int(RESULT_SET_KEYSPACE, buf);
        types::write_string(&self.keyspace_name, buf)
    }
}

impl Result {
    /// Writes the result in its wire form. Used by test servers.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> StdResult<(), std::num::TryFromIntError> {
        match self {
            Result::Void => {
                types::write_int(RESULT_VOID, buf);
                Ok(())
            }
            Result::Rows(rows) => rows.serialize(buf),
            Result::SetKeyspace(set_keyspace) => set_keyspace.serialize(buf),
            Result::SchemaChange(change) => {
                types::write_int(RESULT_SCHEMA_CHANGE, buf);
                buf.extend_from_slice(&change.body);
                Ok(())
            }
        }
    }
}
