use std::{borrow::Cow, collections::HashMap, ops::ControlFlow, sync::Arc};

use crate::frame::frame_errors::{
    CqlRequestSerializationError, QuerySerializationError, RequestDeserializationError,
};
use crate::frame::protocol_version::ProtocolVersion;
use bytes::{BufMut, Bytes};

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::DeserializableRequest;

// Query flags
const FLAG_VALUES: u32 = 0x01;
const FLAG_PAGE_SIZE: u32 = 0x04;
const FLAG_WITH_PAGING_STATE: u32 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;
// DSE-only query flags, which do not fit into the one-byte flags of V3/V4
const FLAG_PAGE_SIZE_BYTES: u32 = 0x4000_0000;
const FLAG_CONTINUOUS_PAGING: u32 = 0x8000_0000;
const ALL_FLAGS: u32 = FLAG_VALUES
    | FLAG_PAGE_SIZE
    | FLAG_WITH_PAGING_STATE
    | FLAG_WITH_SERIAL_CONSISTENCY
    | FLAG_WITH_DEFAULT_TIMESTAMP
    | FLAG_PAGE_SIZE_BYTES
    | FLAG_CONTINUOUS_PAGING;

/// The CQL protocol-level representation of a `QUERY` request,
/// used to execute a single unprepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<'q> {
    /// CQL text of the query.
    pub contents: Cow<'q, str>,

    /// Various parameters controlling the execution of the query.
    pub parameters: QueryParameters,

    /// Custom payload sent along with the frame, e.g. graph options.
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)
            .map_err(|_| QuerySerializationError::ContentsTooLong(self.contents.len()))?;
        self.parameters.serialize(buf, version)?;
        Ok(())
    }

    fn custom_payload(&self) -> Option<&HashMap<String, Bytes>> {
        self.custom_payload.as_ref()
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(
        buf: &mut &[u8],
        version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let parameters = QueryParameters::deserialize(buf, version)?;

        Ok(Self {
            contents,
            parameters,
            custom_payload: None,
        })
    }
}

/// Options of a DSE continuous paging request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContinuousPagingOptions {
    /// Total number of pages the server may send, 0 meaning no limit.
    pub max_pages: i32,

    /// Upper bound on the page rate, 0 meaning no limit.
    pub max_pages_per_second: i32,

    /// Initial page credit of the client. Only sent with `DseV2`.
    pub next_pages: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    /// Whether `page_size` counts bytes instead of rows.
    pub page_size_in_bytes: bool,
    pub paging_state: PagingState,
    /// Positional values, already serialized.
    pub values: Vec<Option<Bytes>>,
    pub continuous_paging: Option<ContinuousPagingOptions>,
}

impl Default for QueryParameters {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            page_size_in_bytes: false,
            paging_state: PagingState::start(),
            values: Vec::new(),
            continuous_paging: None,
        }
    }
}

impl QueryParameters {
    pub fn serialize(
        &self,
        buf: &mut impl BufMut,
        version: ProtocolVersion,
    ) -> Result<(), QuerySerializationError> {
        if self.continuous_paging.is_some() && !version.supports_continuous_paging() {
            return Err(QuerySerializationError::ContinuousPagingUnsupported(version));
        }
        if self.page_size_in_bytes && !version.uses_int_query_flags() {
            return Err(QuerySerializationError::PageSizeInBytesUnsupported(version));
        }

        types::write_consistency(self.consistency, buf);

        let paging_state = self.paging_state.as_bytes_slice();

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
            if self.page_size_in_bytes {
                flags |= FLAG_PAGE_SIZE_BYTES;
            }
        }

        if paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        if self.continuous_paging.is_some() {
            flags |= FLAG_CONTINUOUS_PAGING;
        }

        if version.uses_int_query_flags() {
            buf.put_u32(flags);
        } else {
            buf.put_u8(flags as u8);
        }

        if !self.values.is_empty() {
            let count = u16::try_from(self.values.len())
                .map_err(|_| QuerySerializationError::TooManyValues(self.values.len()))?;
            types::write_short(count, buf);
            for value in &self.values {
                types::write_bytes_opt(value.as_ref(), buf).map_err(|_| {
                    QuerySerializationError::ValueTooLong(value.as_ref().map_or(0, Bytes::len))
                })?;
            }
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = paging_state {
            types::write_bytes(paging_state, buf)
                .map_err(|_| QuerySerializationError::PagingStateTooLong(paging_state.len()))?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        if let Some(options) = self.continuous_paging {
            types::write_int(options.max_pages, buf);
            types::write_int(options.max_pages_per_second, buf);
            if version.supports_page_credits() {
                types::write_int(options.next_pages, buf);
            }
        }

        Ok(())
    }

    pub fn deserialize(
        buf: &mut &[u8],
        version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;

        let flags = if version.uses_int_query_flags() {
            types::read_int(buf)? as u32
        } else {
            u32::from(types::read_raw_bytes(1, buf)?[0])
        };
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(RequestDeserializationError::UnknownFlags {
                flags: unknown_flags,
            });
        }
        let values_flag = (flags & FLAG_VALUES) != 0;
        let page_size_flag = (flags & FLAG_PAGE_SIZE) != 0;
        let paging_state_flag = (flags & FLAG_WITH_PAGING_STATE) != 0;
        let serial_consistency_flag = (flags & FLAG_WITH_SERIAL_CONSISTENCY) != 0;
        let default_timestamp_flag = (flags & FLAG_WITH_DEFAULT_TIMESTAMP) != 0;
        let page_size_in_bytes = (flags & FLAG_PAGE_SIZE_BYTES) != 0;
        let continuous_paging_flag = (flags & FLAG_CONTINUOUS_PAGING) != 0;

        let values = if values_flag {
            let count = types::read_short(buf)?;
            (0..count)
                .map(|_| types::read_bytes_opt(buf).map(|v| v.map(Bytes::copy_from_slice)))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        let page_size = page_size_flag.then(|| types::read_int(buf)).transpose()?;
        let paging_state = if paging_state_flag {
            PagingState::new_from_raw_bytes(types::read_bytes(buf)?)
        } else {
            PagingState::start()
        };
        let serial_consistency = serial_consistency_flag
            .then(|| types::read_consistency(buf))
            .transpose()?
            .map(|consistency| {
                consistency
                    .as_serial()
                    .ok_or(RequestDeserializationError::ExpectedSerialConsistency(consistency))
            })
            .transpose()?;
        let timestamp = if default_timestamp_flag {
            Some(types::read_long(buf)?)
        } else {
            None
        };
        let continuous_paging = if continuous_paging_flag {
            let max_pages = types::read_int(buf)?;
            let max_pages_per_second = types::read_int(buf)?;
            let next_pages = if version.supports_page_credits() {
                types::read_int(buf)?
            } else {
                0
            };
            Some(ContinuousPagingOptions {
                max_pages,
                max_pages_per_second,
                next_pages,
            })
        } else {
            None
        };

        Ok(Self {
            consistency,
            serial_consistency,
            timestamp,
            page_size,
            page_size_in_bytes,
            paging_state,
            values,
            continuous_paging,
        })
    }
}

/// Opaque position in a classic (page-at-a-time) result set,
/// sent back to the server to fetch the page that follows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagingState(Option<Arc<[u8]>>);

impl PagingState {
    /// A paging state that starts from the first page.
    #[inline]
    pub fn start() -> Self {
        Self(None)
    }

    /// Wraps raw bytes received from the server.
    #[inline]
    pub fn new_from_raw_bytes(raw_bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(Some(raw_bytes.into()))
    }

    /// The raw bytes, or `None` when this points at the first page.
    #[inline]
    pub fn as_bytes_slice(&self) -> Option<&Arc<[u8]>> {
        self.0.as_ref()
    }
}

/// What the server said about the pages following the one it just returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagingStateResponse {
    HasMorePages { state: PagingState },
    NoMorePages,
}

impl PagingStateResponse {
    #[inline]
    pub fn finished(&self) -> bool {
        matches!(*self, Self::NoMorePages)
    }

    pub(crate) fn new_from_raw_bytes(raw_paging_state: Option<&[u8]>) -> Self {
        match raw_paging_state {
            Some(raw_bytes) => Self::HasMorePages {
                state: PagingState::new_from_raw_bytes(raw_bytes),
            },
            None => Self::NoMorePages,
        }
    }

    /// Converts the response into a [`ControlFlow`], which is handy in paging loops.
    #[inline]
    pub fn into_paging_control_flow(self) -> ControlFlow<(), PagingState> {
        match self {
            Self::HasMorePages {
                state: next_page_handle,
            } => ControlFlow::Continue(next_page_handle),
            Self::NoMorePages => ControlFlow::Break(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::frame::types::{Consistency, SerialConsistency};

    fn continuous_query() -> Query<'static> {
        Query {
            contents: Cow::Borrowed("SELECT * FROM ks.t"),
            parameters: QueryParameters {
                consistency: Consistency::LocalQuorum,
                page_size: Some(10),
                values: vec![Some(Bytes::from_static(&[0, 0, 0, 7])), None],
                continuous_paging: Some(ContinuousPagingOptions {
                    max_pages: 10,
                    max_pages_per_second: 0,
                    next_pages: 1,
                }),
                ..Default::default()
            },
            custom_payload: None,
        }
    }

    #[test]
    fn continuous_query_survives_dse_v2() {
        let query = continuous_query();
        let bytes = query.to_bytes(ProtocolVersion::DseV2).unwrap();
        let parsed = Query::deserialize(&mut &bytes[..], ProtocolVersion::DseV2).unwrap();
        assert_eq!(parsed, query);
    }

    #[test]
    fn dse_v1_omits_page_credit() {
        let query = continuous_query();
        let v1 = query.to_bytes(ProtocolVersion::DseV1).unwrap();
        let v2 = query.to_bytes(ProtocolVersion::DseV2).unwrap();
        assert_eq!(v2.len(), v1.len() + 4);

        let parsed = Query::deserialize(&mut &v1[..], ProtocolVersion::DseV1).unwrap();
        assert_eq!(parsed.parameters.continuous_paging.unwrap().next_pages, 0);
    }

    #[test]
    fn flags_width_depends_on_version() {
        let query = Query {
            contents: Cow::Borrowed("q"),
            parameters: QueryParameters {
                page_size: Some(5),
                ..Default::default()
            },
            custom_payload: None,
        };
        let v4 = query.to_bytes(ProtocolVersion::V4).unwrap();
        // long string (4 + 1), consistency (2), flags (1)
        assert_eq!(v4[7], FLAG_PAGE_SIZE as u8);
        let dse = query.to_bytes(ProtocolVersion::DseV1).unwrap();
        assert_eq!(&dse[7..11], &FLAG_PAGE_SIZE.to_be_bytes());
    }

    #[test]
    fn dse_features_are_refused_on_plain_versions() {
        let query = continuous_query();
        assert_matches!(
            query.to_bytes(ProtocolVersion::V4),
            Err(CqlRequestSerializationError::QuerySerialization(
                QuerySerializationError::ContinuousPagingUnsupported(ProtocolVersion::V4)
            ))
        );

        let query = Query {
            contents: Cow::Borrowed("q"),
            parameters: QueryParameters {
                page_size: Some(4096),
                page_size_in_bytes: true,
                ..Default::default()
            },
            custom_payload: None,
        };
        assert_matches!(
            query.to_bytes(ProtocolVersion::V3),
            Err(CqlRequestSerializationError::QuerySerialization(
                QuerySerializationError::PageSizeInBytesUnsupported(ProtocolVersion::V3)
            ))
        );
        let bytes = query.to_bytes(ProtocolVersion::DseV2).unwrap();
        let parsed = Query::deserialize(&mut &bytes[..], ProtocolVersion::DseV2).unwrap();
        assert!(parsed.parameters.page_size_in_bytes);
    }

    #[test]
    fn paging_state_and_serial_consistency_are_carried() {
        let query = Query {
            contents: Cow::Borrowed("q"),
            parameters: QueryParameters {
                serial_consistency: Some(SerialConsistency::LocalSerial),
                timestamp: Some(42),
                page_size: Some(3),
                paging_state: PagingState::new_from_raw_bytes(&[1, 2, 3][..]),
                ..Default::default()
            },
            custom_payload: None,
        };
        let bytes = query.to_bytes(ProtocolVersion::V4).unwrap();
        let parsed = Query::deserialize(&mut &bytes[..], ProtocolVersion::V4).unwrap();
        assert_eq!(parsed, query);
    }

    #[test]
    fn paging_state_response_control_flow() {
        assert!(PagingStateResponse::new_from_raw_bytes(None).finished());
        let response = PagingStateResponse::new_from_raw_bytes(Some(&[9u8][..]));
        assert_matches!(
            response.into_paging_control_flow(),
            ControlFlow::Continue(state) if state.as_bytes_slice().map(|s| &s[..]) == Some(&[9][..])
        );
    }
}
