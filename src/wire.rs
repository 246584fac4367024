// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Message framing: OP_MSG, OP_COMPRESSED and the legacy OP_REPLY.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/message/OP_MSG.rst

use {
	crate::{*, common::ConnectOptions, error::{CommandError, ProtocolError}},
	std::mem::size_of,
	bson::{Bson, Document, oid::ObjectId},
	futures::io::{AsyncRead, AsyncReadExt},
	serde::{Serialize, Deserialize}
};

pub const MIN_WIRE_VERSION:         i32   = 6;
pub const MAX_WIRE_VERSION:         i32   = 25;
pub const HEADER_LEN:               usize = 16;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;
pub const DEFAULT_MAX_BSON_SIZE:    usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_BATCH_SIZE:   usize = 100_000;

#[cfg(feature = "compress")]
pub const SUPPORTED_COMPRESSORS: &[Compressor] = &[Compressor::Zstd];
#[cfg(not(feature = "compress"))]
pub const SUPPORTED_COMPRESSORS: &[Compressor] = &[];

pub const FLAG_CHECKSUM_PRESENT: u32 = 1;
pub const FLAG_MORE_TO_COME:     u32 = 1 << 1;

/// Commands that must never be sent compressed.
const UNCOMPRESSIBLE_COMMANDS: [&str; 9] = [
	"hello", "ismaster", "saslstart", "saslcontinue", "getnonce",
	"authenticate", "createuser", "updateuser", "copydbsaslstart"
];

const COMPRESSION_HEADER_LEN: usize = 9;

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Reply      = 1,
	Compressed = 2012,
	Msg        = 2013
}

impl TryFrom<i32> for OpCode {
	type Error = ProtocolError;

	fn try_from(v: i32) -> std::result::Result<Self, Self::Error> {
		Ok(match v {
			1    => Self::Reply,
			2012 => Self::Compressed,
			2013 => Self::Msg,
			v    => return Err(ProtocolError::OpCode(v))
		})
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
	pub message_length: i32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        OpCode
}

impl Header {
	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
	}

	fn copy_from_slice(buf: &[u8]) -> std::result::Result<Self, ProtocolError> {
		Ok(Self {
			message_length: read_i32(buf, 0)?,
			request_id:     read_i32(buf, 4)?,
			response_to:    read_i32(buf, 8)?,
			op_code:        OpCode::try_from(read_i32(buf, 12)?)?
		})
	}
}

fn read_i32(buf: &[u8], offset: usize) -> std::result::Result<i32, ProtocolError> {
	buf.get(offset..offset + size_of::<i32>())
		.map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
		.ok_or(ProtocolError::Malformed("truncated integer"))
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Compressor {
	Noop   = 0,
	Snappy = 1,
	Zlib   = 2,
	Zstd   = 3
}

impl Compressor {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Noop   => "noop",
			Self::Snappy => "snappy",
			Self::Zlib   => "zlib",
			Self::Zstd   => "zstd"
		}
	}

	fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
		match self {
			Self::Noop => Ok(data.to_vec()),
			#[cfg(feature = "compress")]
			Self::Zstd => Ok(zstd::stream::encode_all(data, 0)?),
			compressor => Err(ProtocolError::Compression(compressor as u8).into())
		}
	}

	fn decompress(id: u8, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
		let out = match id {
			0 => data.to_vec(),
			#[cfg(feature = "compress")]
			3 => zstd::stream::decode_all(data)?,
			id => return Err(ProtocolError::Compression(id).into())
		};

		if out.len() != uncompressed_size {
			return Err(ProtocolError::Malformed("uncompressed size mismatch").into());
		}
		Ok(out)
	}
}

impl std::str::FromStr for Compressor {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"noop"   => Self::Noop,
			"snappy" => Self::Snappy,
			"zlib"   => Self::Zlib,
			"zstd"   => Self::Zstd,
			_ => return Err(())
		})
	}
}

impl Serialize for Compressor {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for Compressor {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		Ok(String::deserialize(deserializer)?.parse().unwrap_or(Self::Noop))
	}
}

/// A kind 1 section: a named run of documents.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
	pub identifier: String,
	pub documents:  Vec<Document>
}

/// A decoded OP_MSG. Legacy OP_REPLY frames decode into the same shape with their first document as body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	pub request_id:  i32,
	pub response_to: i32,
	pub flags:       u32,
	pub body:        Document,
	pub sequences:   Vec<DocumentSequence>
}

impl Message {
	pub fn new(body: Document) -> Self {
		Self { request_id: 0, response_to: 0, flags: 0, body, sequences: Vec::new() }
	}

	pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
		self.sequences.push(DocumentSequence { identifier: identifier.into(), documents });
		self
	}

	/// The command name, i.e. the first key of the body.
	pub fn command_name(&self) -> &str {
		self.body.keys().next().map(String::as_str).unwrap_or_default()
	}

	pub fn compressible(&self) -> bool {
		let name = self.command_name().to_ascii_lowercase();
		!UNCOMPRESSIBLE_COMMANDS.contains(&name.as_str())
	}

	/// Folds all document sequences into the body as arrays, which is what the server does as well.
	pub fn into_document(self) -> Document {
		let mut body = self.body;
		for seq in self.sequences {
			body.insert(seq.identifier, seq.documents.into_iter().map(Bson::Document).collect::<Vec<_>>());
		}
		body
	}

	pub fn encode(&self, compressor: Option<Compressor>) -> Result<Vec<u8>> {
		let mut payload = Vec::with_capacity(256);
		payload.extend_from_slice(&self.flags.to_le_bytes());
		payload.push(0);
		self.body.to_writer(&mut payload)?;

		for seq in &self.sequences {
			payload.push(1);
			let start = payload.len();
			payload.extend_from_slice(&[0; 4]);
			payload.extend_from_slice(seq.identifier.as_bytes());
			payload.push(0);

			for doc in &seq.documents {
				doc.to_writer(&mut payload)?;
			}

			let size = (payload.len() - start) as i32;
			payload[start..start + 4].copy_from_slice(&size.to_le_bytes());
		}

		let mut buf = vec![0u8; HEADER_LEN];
		let op_code = match compressor {
			None => {
				buf.extend_from_slice(&payload);
				OpCode::Msg
			}
			Some(compressor) => {
				buf.extend_from_slice(&(OpCode::Msg as i32).to_le_bytes());
				buf.extend_from_slice(&(payload.len() as i32).to_le_bytes());
				buf.push(compressor as u8);
				buf.extend_from_slice(&compressor.compress(&payload)?);
				OpCode::Compressed
			}
		};

		let message_length = i32::try_from(buf.len())
			.map_err(|_| ProtocolError::MessageLength(buf.len() as i64))?;

		Header {
			message_length,
			request_id:  self.request_id,
			response_to: self.response_to,
			op_code
		}.copy_to_slice(&mut buf[..HEADER_LEN]);

		Ok(buf)
	}

	/// Decodes everything following the header.
	pub fn decode(header: Header, payload: &[u8]) -> Result<Self> {
		match header.op_code {
			OpCode::Msg => Self::decode_msg(header, payload),
			OpCode::Reply => Self::decode_reply(header, payload),
			OpCode::Compressed => {
				if payload.len() < COMPRESSION_HEADER_LEN {
					return Err(ProtocolError::Malformed("truncated compression header").into());
				}

				let original = OpCode::try_from(read_i32(payload, 0)?)?;
				let size     = read_i32(payload, 4)?;
				if original == OpCode::Compressed || size < 0 {
					return Err(ProtocolError::Malformed("invalid compression header").into());
				}

				let data = Compressor::decompress(payload[8], &payload[COMPRESSION_HEADER_LEN..], size as usize)?;
				Self::decode(Header { op_code: original, ..header }, &data)
			}
		}
	}

	fn decode_msg(header: Header, payload: &[u8]) -> Result<Self> {
		let flags = read_i32(payload, 0)? as u32;
		let end = if flags & FLAG_CHECKSUM_PRESENT != 0 {
			payload.len().checked_sub(4).ok_or(ProtocolError::Malformed("truncated checksum"))?
		} else {
			payload.len()
		};

		let mut body      = None;
		let mut sequences = Vec::new();
		let mut pos       = 4;

		while pos < end {
			let kind = payload[pos];
			pos += 1;

			match kind {
				0 => {
					let len = document_len(payload, pos, end)?;
					if body.replace(decode_document(&payload[pos..pos + len])?).is_some() {
						return Err(ProtocolError::Malformed("multiple body sections").into());
					}
					pos += len;
				}
				1 => {
					let size = read_i32(payload, pos)?;
					let section_end = pos.checked_add(size as usize)
						.filter(|e| size >= 5 && *e <= end)
						.ok_or(ProtocolError::Malformed("invalid sequence size"))?;

					let id_start = pos + 4;
					let id_end = payload[id_start..section_end].iter()
						.position(|b| *b == 0)
						.map(|i| id_start + i)
						.ok_or(ProtocolError::Malformed("unterminated sequence identifier"))?;
					let identifier = std::str::from_utf8(&payload[id_start..id_end])
						.map_err(|_| ProtocolError::Malformed("sequence identifier is not utf-8"))?
						.to_string();

					let mut documents = Vec::new();
					let mut doc_pos = id_end + 1;
					while doc_pos < section_end {
						let len = document_len(payload, doc_pos, section_end)?;
						documents.push(decode_document(&payload[doc_pos..doc_pos + len])?);
						doc_pos += len;
					}

					sequences.push(DocumentSequence { identifier, documents });
					pos = section_end;
				}
				kind => return Err(ProtocolError::PayloadType(kind).into())
			}
		}

		Ok(Self {
			request_id:  header.request_id,
			response_to: header.response_to,
			flags,
			body:        body.ok_or(ProtocolError::Malformed("missing body section"))?,
			sequences
		})
	}

	fn decode_reply(header: Header, payload: &[u8]) -> Result<Self> {
		// response flags (4), cursor id (8), starting from (4), number returned (4)
		const PREFIX: usize = 20;

		if read_i32(payload, 16)? < 1 {
			return Err(ProtocolError::Malformed("reply without documents").into());
		}

		let len = document_len(payload, PREFIX, payload.len())?;
		Ok(Self {
			request_id:  header.request_id,
			response_to: header.response_to,
			flags:       0,
			body:        decode_document(&payload[PREFIX..PREFIX + len])?,
			sequences:   Vec::new()
		})
	}
}

fn document_len(buf: &[u8], pos: usize, end: usize) -> std::result::Result<usize, ProtocolError> {
	let len = read_i32(buf, pos)?;
	if len < 5 || pos + len as usize > end {
		return Err(ProtocolError::Malformed("invalid document length"));
	}
	Ok(len as usize)
}

/// Reads one complete frame, rejecting lengths outside `[HEADER_LEN + 1, max_message_size]`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, max_message_size: usize) -> Result<Message> {
	let mut buf = [0u8; HEADER_LEN];
	reader.read_exact(&mut buf).await?;
	let header = Header::copy_from_slice(&buf)?;

	let len = header.message_length as i64;
	if len <= HEADER_LEN as i64 || len > max_message_size as i64 {
		return Err(ProtocolError::MessageLength(len).into());
	}

	let mut payload = vec![0u8; len as usize - HEADER_LEN];
	reader.read_exact(&mut payload).await?;
	Message::decode(header, &payload)
}

pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
	let mut buf = Vec::new();
	doc.to_writer(&mut buf)?;
	Ok(buf)
}

pub fn decode_document(bytes: &[u8]) -> Result<Document> {
	Ok(Document::from_reader(bytes)?)
}

/// Reads a numeric field regardless of the BSON number type the server chose.
pub fn get_int(doc: &Document, key: &str) -> Option<i64> {
	match doc.get(key)? {
		Bson::Int32(v)  => Some(*v as i64),
		Bson::Int64(v)  => Some(*v),
		Bson::Double(v) => Some(*v as i64),
		_               => None
	}
}

pub fn reply_ok(doc: &Document) -> bool {
	match doc.get("ok") {
		Some(Bson::Double(v))  => *v == 1.0,
		Some(Bson::Int32(v))   => *v == 1,
		Some(Bson::Int64(v))   => *v == 1,
		Some(Bson::Boolean(v)) => *v,
		_                      => false
	}
}

/// Turns `ok: 0`, `writeErrors` and `writeConcernError` into a `CommandError`.
pub fn check_reply(reply: Document) -> Result<Document> {
	fn error(doc: &Document, message_key: &str, index: Option<i32>) -> CommandError {
		CommandError {
			code:      get_int(doc, "code").unwrap_or_default() as i32,
			code_name: doc.get_str("codeName").ok().map(str::to_string),
			message:   doc.get_str(message_key).unwrap_or("unknown server error").to_string(),
			index
		}
	}

	if !reply_ok(&reply) {
		return Err(error(&reply, "errmsg", None).into());
	}

	if let Some(Bson::Document(doc)) = reply.get_array("writeErrors").ok().and_then(|errors| errors.first()) {
		return Err(error(doc, "errmsg", get_int(doc, "index").map(|i| i as i32)).into());
	}

	if let Ok(doc) = reply.get_document("writeConcernError") {
		return Err(error(doc, "errmsg", None).into());
	}

	Ok(reply)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest<'a> {
	is_master:            i32,
	hello_ok:             bool,
	client:               ClientMetadata<'a>,
	#[serde(skip_serializing_if = "Option::is_none")]
	compression:          Option<&'a [Compressor]>,
	/// `<source>.<username>`, asks the server which SCRAM mechanisms the user supports.
	#[serde(skip_serializing_if = "Option::is_none")]
	sasl_supported_mechs: Option<String>,
	#[serde(rename = "$db")]
	db:                   &'static str
}

impl<'a> HandshakeRequest<'a> {
	pub fn new(options: &'a ConnectOptions) -> Self {
		Self {
			is_master:            1,
			hello_ok:             true,
			client:               ClientMetadata {
				application: options.app_name.as_deref().map(|name| ClientApplication { name }),
				..ClientMetadata::default()
			},
			compression:          (!options.compressors.is_empty()).then_some(options.compressors.as_slice()),
			sasl_supported_mechs: options.credential.as_ref()
				.filter(|c| c.mechanism.is_none())
				.map(|c| format!("{}.{}", c.source, c.username)),
			db:                   "admin"
		}
	}

	pub fn to_document(&self) -> Result<Document> {
		Ok(bson::to_document(self)?)
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMetadata<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	application: Option<ClientApplication<'a>>,
	driver:      ClientDriver,
	os:          ClientOs
}

impl Default for ClientMetadata<'_> {
	fn default() -> Self {
		Self {
			application: None,
			driver:      ClientDriver {
				name:    crate::DRIVER_NAME,
				version: env!("CARGO_PKG_VERSION")
			},
			os:          ClientOs {
				r#type:       std::env::consts::OS,
				architecture: std::env::consts::ARCH
			}
		}
	}
}

#[derive(Debug, Clone, Serialize)]
struct ClientApplication<'a> {
	name: &'a str
}

#[derive(Debug, Clone, Serialize)]
struct ClientDriver {
	name:    &'static str,
	version: &'static str
}

#[derive(Debug, Clone, Serialize)]
struct ClientOs {
	#[serde(rename = "type")]
	r#type:       &'static str,
	architecture: &'static str
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandshakeReply {
	pub ismaster:               Option<bool>,
	pub is_writable_primary:    Option<bool>,
	pub secondary:              bool,
	pub arbiter_only:           bool,
	pub hidden:                 bool,
	pub isreplicaset:           bool,
	pub min_wire_version:       i32,
	pub max_wire_version:       i32,
	pub max_bson_object_size:   Option<i64>,
	pub max_message_size_bytes: Option<i64>,
	pub max_write_batch_size:   Option<i64>,
	pub compression:            Vec<Compressor>,
	pub sasl_supported_mechs:   Option<Vec<String>>,
	// sharded instances
	pub msg:                    Option<String>,
	// replica sets
	pub set_name:               Option<String>,
	pub set_version:            Option<i32>,
	pub election_id:            Option<ObjectId>,
	pub primary:                Option<String>,
	pub me:                     Option<String>,
	pub hosts:                  Vec<String>,
	pub passives:               Vec<String>,
	pub arbiters:               Vec<String>
}

impl HandshakeReply {
	pub fn from_document(doc: Document) -> Result<Self> {
		Ok(bson::from_document(check_reply(doc)?)?)
	}

	pub fn is_writable_primary(&self) -> bool {
		self.is_writable_primary.or(self.ismaster).unwrap_or(false)
	}
}
