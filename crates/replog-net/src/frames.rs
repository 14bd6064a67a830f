//! Frame codec for the replog message bus.
//!
//! Every RPC is a sequence of byte frames. The first frame of a request is
//! a one-byte type tag; responses lead with a one-byte kind tag. The
//! transport envelope (correlation id) is handled in
//! [`crate::transport`], not here.
//!
//! Request layouts:
//!
//! ```text
//! '?'  [?]
//! 'i'  [i]
//! 'u'  [u] [request_id(12)] [payload]
//! 'e'  [e] [from u64 LE] [byte_budget u64 LE] [count_limit u32 LE]
//! '*'  [*] [secret]
//! ```

use bytes::Bytes;

use replog_log::types::{LogIndex, RequestId, REQUEST_ID_LEN};

use crate::error::{NetError, NetResult};
use crate::message::{
    ChunkStatus, ConfigInfo, EntriesChunk, LogInfo, Request, Response, UpdateReply,
};

/// A multipart wire message.
pub type Frames = Vec<Bytes>;

/// Request type tag: cluster configuration.
pub const REQ_CONFIG: u8 = b'?';
/// Request type tag: log info.
pub const REQ_LOG_INFO: u8 = b'i';
/// Request type tag: update.
pub const REQ_UPDATE: u8 = b'u';
/// Request type tag: entry stream.
pub const REQ_ENTRIES: u8 = b'e';
/// Request type tag: publisher URL.
pub const REQ_PUBLISHER_URL: u8 = b'*';

const RESP_CONFIG: u8 = b'C';
const RESP_LOG_INFO: u8 = b'I';
const RESP_UPDATE: u8 = b'U';
const RESP_CHUNK: u8 = b'E';
const RESP_PUBLISHER_URL: u8 = b'P';
const RESP_REDIRECT: u8 = b'R';
const RESP_NO_LEADER: u8 = b'N';
const RESP_ERROR: u8 = b'X';

const CHUNK_HEADER_LEN: usize = 1 + 1 + 8 + 8 + 8;

fn tag_frame(tag: u8) -> Bytes {
    Bytes::copy_from_slice(&[tag])
}

fn u64_frame(v: u64) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

fn read_u64(frame: &[u8], what: &str) -> NetResult<u64> {
    let bytes: [u8; 8] = frame
        .try_into()
        .map_err(|_| NetError::frame(format!("{what} frame must be 8 bytes")))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Encodes a request into wire frames.
pub fn encode_request(req: &Request) -> Frames {
    match req {
        Request::Config => vec![tag_frame(REQ_CONFIG)],
        Request::LogInfo => vec![tag_frame(REQ_LOG_INFO)],
        Request::Update {
            request_id,
            payload,
        } => vec![
            tag_frame(REQ_UPDATE),
            Bytes::copy_from_slice(request_id.as_bytes()),
            Bytes::copy_from_slice(payload),
        ],
        Request::Entries {
            from,
            byte_budget,
            count_limit,
        } => vec![
            tag_frame(REQ_ENTRIES),
            u64_frame(from.as_u64()),
            u64_frame(*byte_budget),
            Bytes::copy_from_slice(&count_limit.to_le_bytes()),
        ],
        Request::PublisherUrl { secret } => {
            vec![tag_frame(REQ_PUBLISHER_URL), Bytes::copy_from_slice(secret)]
        }
    }
}

/// Decodes wire frames into a request.
pub fn decode_request(frames: &Frames) -> NetResult<Request> {
    let tag = frames
        .first()
        .filter(|f| f.len() == 1)
        .map(|f| f[0])
        .ok_or_else(|| NetError::frame("request missing type tag"))?;
    match tag {
        REQ_CONFIG => expect_len(frames, 1).map(|_| Request::Config),
        REQ_LOG_INFO => expect_len(frames, 1).map(|_| Request::LogInfo),
        REQ_UPDATE => {
            expect_len(frames, 3)?;
            let id: [u8; REQUEST_ID_LEN] = frames[1]
                .as_ref()
                .try_into()
                .map_err(|_| NetError::frame("request id frame must be 12 bytes"))?;
            Ok(Request::Update {
                request_id: RequestId::from_bytes(id),
                payload: frames[2].to_vec(),
            })
        }
        REQ_ENTRIES => {
            expect_len(frames, 4)?;
            let from = read_u64(&frames[1], "from_index")?;
            let byte_budget = read_u64(&frames[2], "byte_budget")?;
            let count_limit: [u8; 4] = frames[3]
                .as_ref()
                .try_into()
                .map_err(|_| NetError::frame("count_limit frame must be 4 bytes"))?;
            Ok(Request::Entries {
                from: LogIndex::new(from),
                byte_budget,
                count_limit: u32::from_le_bytes(count_limit),
            })
        }
        REQ_PUBLISHER_URL => {
            expect_len(frames, 2)?;
            Ok(Request::PublisherUrl {
                secret: frames[1].to_vec(),
            })
        }
        other => Err(NetError::frame(format!("unknown request tag {other:#04x}"))),
    }
}

fn expect_len(frames: &Frames, len: usize) -> NetResult<()> {
    if frames.len() != len {
        return Err(NetError::frame(format!(
            "expected {len} frames, got {}",
            frames.len()
        )));
    }
    Ok(())
}

fn encode_chunk(chunk: &EntriesChunk) -> Frames {
    let mut header = Vec::with_capacity(CHUNK_HEADER_LEN);
    header.push(chunk.status as u8);
    header.push(chunk.is_last as u8);
    header.extend_from_slice(&chunk.last_index.as_u64().to_le_bytes());
    header.extend_from_slice(&chunk.byte_offset.to_le_bytes());
    header.extend_from_slice(&chunk.byte_size.to_le_bytes());
    vec![
        tag_frame(RESP_CHUNK),
        Bytes::from(header),
        Bytes::copy_from_slice(&chunk.payload),
    ]
}

fn decode_chunk(frames: &Frames) -> NetResult<EntriesChunk> {
    expect_len(frames, 3)?;
    let header = &frames[1];
    if header.len() != CHUNK_HEADER_LEN {
        return Err(NetError::frame(format!(
            "chunk header must be {CHUNK_HEADER_LEN} bytes, got {}",
            header.len()
        )));
    }
    let status = ChunkStatus::from_u8(header[0])
        .ok_or_else(|| NetError::frame(format!("unknown chunk status {}", header[0])))?;
    Ok(EntriesChunk {
        status,
        is_last: header[1] != 0,
        last_index: LogIndex::new(u64::from_le_bytes(header[2..10].try_into().unwrap())),
        byte_offset: u64::from_le_bytes(header[10..18].try_into().unwrap()),
        byte_size: u64::from_le_bytes(header[18..26].try_into().unwrap()),
        payload: frames[2].to_vec(),
    })
}

/// Encodes a response into wire frames.
pub fn encode_response(resp: &Response) -> NetResult<Frames> {
    Ok(match resp {
        Response::Config(info) => vec![
            tag_frame(RESP_CONFIG),
            Bytes::from(bincode::serialize(info)?),
        ],
        Response::LogInfo(info) => vec![
            tag_frame(RESP_LOG_INFO),
            Bytes::from(bincode::serialize(info)?),
        ],
        Response::Update(reply) => vec![
            tag_frame(RESP_UPDATE),
            Bytes::from(bincode::serialize(reply)?),
        ],
        Response::Chunk(chunk) => encode_chunk(chunk),
        Response::PublisherUrl(url) => vec![
            tag_frame(RESP_PUBLISHER_URL),
            Bytes::copy_from_slice(url.as_deref().unwrap_or("").as_bytes()),
        ],
        Response::Redirect {
            leader_id,
            leader_url,
        } => vec![
            tag_frame(RESP_REDIRECT),
            u64_frame(*leader_id),
            Bytes::copy_from_slice(leader_url.as_bytes()),
        ],
        Response::NoLeader => vec![tag_frame(RESP_NO_LEADER)],
        Response::Error { msg } => vec![
            tag_frame(RESP_ERROR),
            Bytes::copy_from_slice(msg.as_bytes()),
        ],
    })
}

/// Decodes wire frames into a response.
pub fn decode_response(frames: &Frames) -> NetResult<Response> {
    let tag = frames
        .first()
        .filter(|f| f.len() == 1)
        .map(|f| f[0])
        .ok_or_else(|| NetError::frame("response missing kind tag"))?;
    match tag {
        RESP_CONFIG => {
            expect_len(frames, 2)?;
            Ok(Response::Config(bincode::deserialize::<ConfigInfo>(
                &frames[1],
            )?))
        }
        RESP_LOG_INFO => {
            expect_len(frames, 2)?;
            Ok(Response::LogInfo(bincode::deserialize::<LogInfo>(
                &frames[1],
            )?))
        }
        RESP_UPDATE => {
            expect_len(frames, 2)?;
            Ok(Response::Update(bincode::deserialize::<UpdateReply>(
                &frames[1],
            )?))
        }
        RESP_CHUNK => Ok(Response::Chunk(decode_chunk(frames)?)),
        RESP_PUBLISHER_URL => {
            expect_len(frames, 2)?;
            let url = std::str::from_utf8(&frames[1])
                .map_err(|_| NetError::frame("publisher url is not utf-8"))?;
            Ok(Response::PublisherUrl(if url.is_empty() {
                None
            } else {
                Some(url.to_string())
            }))
        }
        RESP_REDIRECT => {
            expect_len(frames, 3)?;
            let leader_id = read_u64(&frames[1], "leader_id")?;
            let leader_url = std::str::from_utf8(&frames[2])
                .map_err(|_| NetError::frame("leader url is not utf-8"))?
                .to_string();
            Ok(Response::Redirect {
                leader_id,
                leader_url,
            })
        }
        RESP_NO_LEADER => expect_len(frames, 1).map(|_| Response::NoLeader),
        RESP_ERROR => {
            expect_len(frames, 2)?;
            Ok(Response::Error {
                msg: String::from_utf8_lossy(&frames[1]).into_owned(),
            })
        }
        other => Err(NetError::frame(format!("unknown response tag {other:#04x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PeerInfo, UpdateStatus};
    use crate::url::PeerUrl;
    use replog_log::types::Term;

    #[test]
    fn test_request_roundtrip_all_types() {
        let requests = vec![
            Request::Config,
            Request::LogInfo,
            Request::Update {
                request_id: RequestId::from_parts(1_700_000_000_000, 7),
                payload: b"hello".to_vec(),
            },
            Request::Entries {
                from: LogIndex::new(42),
                byte_budget: 1 << 20,
                count_limit: 500,
            },
            Request::PublisherUrl {
                secret: b"cluster-secret".to_vec(),
            },
        ];
        for req in requests {
            let frames = encode_request(&req);
            assert_eq!(decode_request(&frames).unwrap(), req);
        }
    }

    #[test]
    fn test_request_tag_bytes_match_protocol() {
        assert_eq!(encode_request(&Request::Config)[0].as_ref(), b"?");
        assert_eq!(encode_request(&Request::LogInfo)[0].as_ref(), b"i");
        assert_eq!(
            encode_request(&Request::PublisherUrl { secret: vec![] })[0].as_ref(),
            b"*"
        );
    }

    #[test]
    fn test_response_roundtrip_all_types() {
        let responses = vec![
            Response::Config(ConfigInfo {
                peers: vec![PeerInfo {
                    id: 1,
                    url: PeerUrl::parse("tcp://127.0.0.1:4087").unwrap(),
                }],
                leader_id: Some(1),
            }),
            Response::LogInfo(LogInfo {
                is_leader: true,
                leader_id: Some(1),
                current_term: Term::new(3),
                first_index: LogIndex::new(1),
                last_applied: LogIndex::new(10),
                commit_index: LogIndex::new(10),
                last_index: LogIndex::new(12),
                prune_index: LogIndex::new(8),
                snapshot_size: 1024,
            }),
            Response::Update(UpdateReply {
                status: UpdateStatus::Committed,
                commit_index: LogIndex::new(11),
            }),
            Response::Chunk(EntriesChunk::entry(LogIndex::new(5), vec![1, 2, 3])),
            Response::Chunk(EntriesChunk::snapshot(
                LogIndex::new(100),
                4096,
                65536,
                false,
                vec![0xAA; 32],
            )),
            Response::Chunk(EntriesChunk::done(LogIndex::new(9))),
            Response::Chunk(EntriesChunk::error("boom")),
            Response::PublisherUrl(Some("tcp://127.0.0.1:4088".to_string())),
            Response::PublisherUrl(None),
            Response::Redirect {
                leader_id: 2,
                leader_url: "tcp://10.0.0.2:4087".to_string(),
            },
            Response::NoLeader,
            Response::Error {
                msg: "nope".to_string(),
            },
        ];
        for resp in responses {
            let frames = encode_response(&resp).unwrap();
            assert_eq!(decode_response(&frames).unwrap(), resp);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_request(&vec![]).is_err());
        assert!(decode_request(&vec![Bytes::from_static(b"zz")]).is_err());
        assert!(decode_request(&vec![Bytes::from_static(b"q")]).is_err());
        assert!(decode_response(&vec![Bytes::from_static(b"q")]).is_err());
        // Update with a short request id frame.
        assert!(decode_request(&vec![
            Bytes::from_static(b"u"),
            Bytes::from_static(b"short"),
            Bytes::from_static(b"payload"),
        ])
        .is_err());
    }

    #[test]
    fn test_chunk_header_widths() {
        let frames = encode_response(&Response::Chunk(EntriesChunk::snapshot(
            LogIndex::new(7),
            10,
            20,
            true,
            vec![9; 4],
        )))
        .unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].len(), CHUNK_HEADER_LEN);
        assert_eq!(frames[2].len(), 4);
    }
}
