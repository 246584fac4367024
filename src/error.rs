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

use {
	crate::common::ServerAddress,
	std::{io, sync::Arc},
	thiserror::Error as ThisError
};

/// Server error codes after which the node must be treated as no longer writable.
///
/// NotWritablePrimary, NotPrimaryNoSecondaryOk, NotPrimaryOrSecondary, PrimarySteppedDown,
/// ShutdownInProgress, InterruptedAtShutdown and InterruptedDueToReplStateChange.
pub const NOT_PRIMARY_CODES: [i32; 7] = [10107, 13435, 13436, 189, 91, 11600, 11602];

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, ThisError)]
pub enum Error {
	#[error("transport error: {0}")]
	Transport(Arc<io::Error>),
	#[error("authentication failed: {0}")]
	Authentication(AuthError),
	#[error("command failed: {0}")]
	Command(CommandError),
	#[error("timed out waiting for a connection to {0}")]
	PoolTimeout(ServerAddress),
	#[error("protocol error: {0}")]
	Protocol(ProtocolError),
	#[error("no server reachable: {0}")]
	ClusterUnreachable(String),
	#[error("the cluster has been closed")]
	ClusterClosed,
	#[error("no primary available")]
	NoPrimary,
	#[error("no server matches the read preference")]
	NoMatchingServer,
	#[error("server {address} speaks wire versions {min}..={max}, which is not supported")]
	IncompatibleServer { address: ServerAddress, min: i32, max: i32 },
	#[error("illegal state: {0}")]
	IllegalState(&'static str),
	#[error("the connection has been closed")]
	ConnectionClosed,
	#[error("invalid connection options: {0}")]
	InvalidOptions(String),
	#[error("failed to encode document: {0}")]
	Encode(Arc<bson::ser::Error>),
	#[error("failed to decode document: {0}")]
	Decode(Arc<bson::de::Error>),
	#[error("a lock was poisoned")]
	Sync
}

impl Error {
	/// Returns true for "not primary" and "node is recovering" command errors.
	pub fn is_not_primary(&self) -> bool {
		matches!(self, Self::Command(e) if e.is_not_primary())
	}

	/// The server error code, if this is a command error.
	pub fn code(&self) -> Option<i32> {
		match self {
			Self::Command(e) => Some(e.code),
			_ => None
		}
	}

	pub(crate) fn invalid_options(msg: impl Into<String>) -> Self {
		Self::InvalidOptions(msg.into())
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Self::Transport(Arc::new(e))
	}
}

impl From<bson::ser::Error> for Error {
	fn from(e: bson::ser::Error) -> Self {
		Self::Encode(Arc::new(e))
	}
}

impl From<bson::de::Error> for Error {
	fn from(e: bson::de::Error) -> Self {
		Self::Decode(Arc::new(e))
	}
}

impl From<CommandError> for Error {
	fn from(e: CommandError) -> Self {
		Self::Command(e)
	}
}

impl From<ProtocolError> for Error {
	fn from(e: ProtocolError) -> Self {
		Self::Protocol(e)
	}
}

impl From<AuthError> for Error {
	fn from(e: AuthError) -> Self {
		Self::Authentication(e)
	}
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}

/// An error reported by the server, either as `ok: 0` or inside `writeErrors`/`writeConcernError`.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{message} (code {code}{})", code_name_suffix(.code_name))]
pub struct CommandError {
	pub code:      i32,
	pub code_name: Option<String>,
	pub message:   String,
	/// Index of the failed statement for write errors.
	pub index:     Option<i32>
}

fn code_name_suffix(code_name: &Option<String>) -> String {
	code_name.as_deref().map(|n| format!(", {}", n)).unwrap_or_default()
}

impl CommandError {
	pub fn is_not_primary(&self) -> bool {
		if NOT_PRIMARY_CODES.contains(&self.code) {
			return true;
		}
		let msg = self.message.to_ascii_lowercase();
		msg.contains("not master") || msg.contains("not primary") || msg.contains("node is recovering")
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum ProtocolError {
	#[error("unexpected op code {0}")]
	OpCode(i32),
	#[error("reply to unknown request {0}")]
	ResponseTo(i32),
	#[error("unknown section kind {0}")]
	PayloadType(u8),
	#[error("invalid message length {0}")]
	MessageLength(i64),
	#[error("unsupported compressor {0}")]
	Compression(u8),
	#[error("malformed message: {0}")]
	Malformed(&'static str),
	#[error("reply carries no cursor")]
	MissingCursor
}

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum AuthError {
	#[error("invalid server reply")]
	InvalidReply,
	#[error("server nonce does not extend the client nonce")]
	InvalidServerNonce,
	#[error("server signature mismatch")]
	InvalidServerSignature,
	#[error("iteration count {0} is below the minimum of 4096")]
	InvalidIterationCount(u32),
	#[error("{0}")]
	ServerError(String),
	#[error("unsupported mechanism {0}")]
	UnsupportedMechanism(String),
	#[error("incomplete credential")]
	InvalidOptions
}
