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
	crate::{
		*,
		apm::{Event, Monitor},
		common::{ReadPreference, ReadPreferenceMode},
		error::ProtocolError,
		topology::{Cluster, Node},
		wire::{check_reply, Message}
	},
	std::{fmt, sync::{Arc, atomic::{AtomicU64, Ordering}}, time::Instant},
	bson::{doc, Document},
	serde::Deserialize,
	tracing::{debug, warn}
};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

const READ_COMMANDS: [&str; 8] = [
	"aggregate", "count", "distinct", "find", "getMore", "listCollections", "listDatabases", "listIndexes"
];

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
	pub db:   String,
	pub coll: String
}

impl Namespace {
	pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
		Self { db: db.into(), coll: coll.into() }
	}
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}.{}", self.db, self.coll)
	}
}

impl std::str::FromStr for Namespace {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s.find('.') {
			Some(i) if i > 0 => Ok(Self::new(&s[..i], &s[i + 1..])),
			_ => Err(ProtocolError::Malformed("invalid namespace").into())
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
struct CursorReply {
	cursor: CursorBatch
}

/// The `cursor` sub-document of a cursor-producing reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CursorBatch {
	pub id:    i64,
	pub ns:    String,
	#[serde(alias = "firstBatch", alias = "nextBatch")]
	pub batch: Vec<Document>
}

impl CursorBatch {
	fn from_reply(reply: Document) -> Result<Self> {
		if !reply.contains_key("cursor") {
			return Err(ProtocolError::MissingCursor.into());
		}
		Ok(bson::from_document::<CursorReply>(reply)?.cursor)
	}
}

/// Sends commands to the node the read preference selects, retrying once after a topology
/// refresh if that node turned out to no longer be primary.
#[derive(Debug, Clone)]
pub struct WireProtocol {
	cluster: Cluster,
	monitor: Arc<Monitor>
}

impl WireProtocol {
	pub fn new(cluster: Cluster, monitor: Arc<Monitor>) -> Self {
		Self { cluster, monitor }
	}

	pub fn cluster(&self) -> &Cluster {
		&self.cluster
	}

	/// Runs `command` on the primary and returns its checked reply.
	pub async fn command_single(&self, db: &str, command: Document) -> Result<Document> {
		self.execute(db, Message::new(command), &ReadPreference::PRIMARY).await.map(|(_, reply)| reply)
	}

	pub async fn command_single_with(&self, db: &str, command: Document, read_preference: &ReadPreference) -> Result<Document> {
		self.execute(db, Message::new(command), read_preference).await.map(|(_, reply)| reply)
	}

	/// Runs a cursor-producing command, returning the node that owns the cursor and the first batch.
	pub async fn command_stream(
		&self,
		db:              &str,
		command:         Document,
		read_preference: &ReadPreference
	) -> Result<(Arc<Node>, CursorBatch)> {
		let (node, reply) = self.execute(db, Message::new(command), read_preference).await?;
		Ok((node, CursorBatch::from_reply(reply)?))
	}

	/// Fetches the next batch from the node that created the cursor.
	pub async fn get_more(&self, node: &Node, cursor_id: i64, ns: &Namespace, batch_size: Option<i32>) -> Result<CursorBatch> {
		let mut command = doc! { "getMore": cursor_id, "collection": ns.coll.as_str() };
		if let Some(batch_size) = batch_size {
			command.insert("batchSize", batch_size);
		}
		CursorBatch::from_reply(self.run_on(node, &ns.db, Message::new(command)).await?)
	}

	pub async fn kill_cursors(&self, node: &Node, ns: &Namespace, cursor_ids: &[i64]) -> Result<()> {
		self.run_on(node, &ns.db, Message::new(doc! {
			"killCursors": ns.coll.as_str(),
			"cursors":     cursor_ids.to_vec()
		})).await.map(drop)
	}

	/// Selects a node, runs `msg` and applies the not-primary retry.
	pub async fn execute(&self, db: &str, mut msg: Message, read_preference: &ReadPreference) -> Result<(Arc<Node>, Document)> {
		if read_preference.mode != ReadPreferenceMode::Primary {
			msg.body.insert("$readPreference", doc! { "mode": read_preference.mode.as_str() });
		}

		let node = self.cluster.select_node_wait(read_preference).await?;
		let error = match self.run_on(&node, db, msg.clone()).await {
			Err(e) if e.is_not_primary() && self.retry_enabled(&msg) => e,
			result => return result.map(|reply| (node, reply))
		};

		warn!(address = %node.address, command = msg.command_name(), %error, "node is not primary, refreshing topology");
		self.cluster.update_master().await?;

		let node = self.cluster.select_node_wait(read_preference).await?;
		let reply = self.run_on(&node, db, msg).await?;
		Ok((node, reply))
	}

	fn retry_enabled(&self, msg: &Message) -> bool {
		let options = &self.cluster.options;
		if READ_COMMANDS.contains(&msg.command_name()) {
			options.retry_reads
		} else {
			options.retry_writes
		}
	}

	/// One attempt on one node: acquire, send, await the reply, release, check `ok`.
	pub async fn run_on(&self, node: &Node, db: &str, mut msg: Message) -> Result<Document> {
		msg.body.insert("$db", db);

		let mut conn = node.acquire().await?;
		let operation_id = NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed);
		let command_name = apm::Command::from(msg.command_name());
		let start = Instant::now();

		if self.monitor.is_enabled() {
			let command = msg.clone().into_document();
			self.monitor.emit(Event::CommandStarted {
				address:       &node.address,
				command:       &command,
				database_name: db,
				command_name,
				operation_id,
				connection_id: conn.id()
			});
		}

		let result = match conn.request(msg).await {
			Ok(reply) => check_reply(reply.body),
			Err(e) => Err(e)
		};
		let connection_id = conn.id();
		drop(conn);

		match &result {
			Ok(reply) => self.monitor.emit(Event::CommandSucceeded {
				address:  &node.address,
				duration: start.elapsed(),
				reply,
				command_name,
				operation_id,
				connection_id
			}),
			Err(failure) => {
				debug!(address = %node.address, ?command_name, error = %failure, "command failed");
				self.monitor.emit(Event::CommandFailed {
					address:  &node.address,
					duration: start.elapsed(),
					failure,
					command_name,
					operation_id,
					connection_id
				});
			}
		}

		result
	}
}
