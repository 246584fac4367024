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
		common::ReadPreference,
		protocol::{CursorBatch, Namespace, WireProtocol},
		topology::Node
	},
	std::{collections::VecDeque, fmt, sync::Arc, time::Duration},
	async_std::task,
	bson::{doc, Bson, Document},
	futures::{future::{BoxFuture, FutureExt}, stream::{self, Stream}},
	tracing::{debug, warn}
};

/// The command a cursor was created by, decides how skip, limit and sort are applied.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CursorKind {
	Find,
	Aggregate,
	ListIndexes,
	ListCollections
}

#[derive(Debug)]
enum CursorState {
	/// The initial command has not been sent yet.
	Pending,
	Open {
		node: Arc<Node>,
		id:   i64,
		ns:   Namespace
	},
	/// A get-more is running in its own task, so an abandoned `next()` does not lose its batch.
	Fetching {
		id:    i64,
		ns:    Namespace,
		fetch: GetMore
	},
	Exhausted,
	Closed
}

type GetMoreOutput = (Arc<Node>, Result<CursorBatch>);

struct GetMore(BoxFuture<'static, GetMoreOutput>);

impl fmt::Debug for GetMore {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("GetMore")
	}
}

/// Lazily sends its command on the first `next()` and fetches further batches as the buffer drains.
///
/// Forward only. `skip`, `limit`, `sort` and `batch_size` can only be set before the first `next()`.
#[derive(Debug)]
pub struct Cursor {
	protocol:        WireProtocol,
	db:              String,
	command:         Document,
	kind:            CursorKind,
	read_preference: ReadPreference,
	skip:            Option<u64>,
	limit:           Option<i64>,
	sort:            Option<Document>,
	batch_size:      Option<u32>,
	state:           CursorState,
	buffer:          VecDeque<Document>,
	round_trips:     usize,
	kill_timeout:    Duration
}

impl Cursor {
	pub(crate) fn new(
		protocol:        WireProtocol,
		db:              impl Into<String>,
		command:         Document,
		kind:            CursorKind,
		read_preference: ReadPreference
	) -> Self {
		let kill_timeout = protocol.cluster().options.kill_cursors_timeout;
		Self {
			protocol,
			db: db.into(),
			command,
			kind,
			read_preference,
			skip:         None,
			limit:        None,
			sort:         None,
			batch_size:   None,
			state:        CursorState::Pending,
			buffer:       VecDeque::new(),
			round_trips:  0,
			kill_timeout
		}
	}

	fn check_pending(&self, supported: bool) -> Result<()> {
		if !matches!(self.state, CursorState::Pending) {
			Err(Error::IllegalState("the cursor has already been started"))
		} else if !supported {
			Err(Error::IllegalState("this cursor does not support skip, limit or sort"))
		} else {
			Ok(())
		}
	}

	fn supports_modifiers(&self) -> bool {
		matches!(self.kind, CursorKind::Find | CursorKind::Aggregate)
	}

	pub fn skip(&mut self, n: u64) -> Result<&mut Self> {
		self.check_pending(self.supports_modifiers())?;
		self.skip = Some(n);
		Ok(self)
	}

	pub fn limit(&mut self, n: i64) -> Result<&mut Self> {
		self.check_pending(self.supports_modifiers())?;
		self.limit = Some(n);
		Ok(self)
	}

	pub fn sort(&mut self, spec: Document) -> Result<&mut Self> {
		self.check_pending(self.supports_modifiers())?;
		self.sort = Some(spec);
		Ok(self)
	}

	/// Number of documents per batch, also used for every get-more.
	pub fn batch_size(&mut self, n: u32) -> Result<&mut Self> {
		self.check_pending(true)?;
		self.batch_size = Some(n);
		Ok(self)
	}

	/// Requests sent so far, the initial command included.
	pub fn round_trips(&self) -> usize {
		self.round_trips
	}

	/// The server side cursor id, zero once exhausted.
	pub fn id(&self) -> i64 {
		match &self.state {
			CursorState::Open { id, .. } | CursorState::Fetching { id, .. } => *id,
			_ => 0
		}
	}

	pub fn is_exhausted(&self) -> bool {
		self.buffer.is_empty() && matches!(self.state, CursorState::Exhausted | CursorState::Closed)
	}

	/// The command with skip, limit, sort and batch size folded in.
	fn initial_command(&self) -> Result<Document> {
		let mut command = self.command.clone();
		let batch_size = self.batch_size.map(|n| n as i32);

		match self.kind {
			CursorKind::Find => {
				if let Some(sort) = &self.sort {
					command.insert("sort", sort.clone());
				}
				if let Some(skip) = self.skip {
					command.insert("skip", skip as i64);
				}
				if let Some(limit) = self.limit {
					command.insert("limit", limit);
				}
				if let Some(batch_size) = batch_size {
					command.insert("batchSize", batch_size);
				}
			}
			CursorKind::Aggregate => {
				let mut pipeline = match command.remove("pipeline") {
					Some(Bson::Array(pipeline)) => pipeline,
					None => Vec::new(),
					Some(_) => return Err(Error::IllegalState("the pipeline must be an array"))
				};

				if let Some(sort) = &self.sort {
					pipeline.push(doc! { "$sort": sort.clone() }.into());
				}
				if let Some(skip) = self.skip {
					pipeline.push(doc! { "$skip": skip as i64 }.into());
				}
				if let Some(limit) = self.limit {
					pipeline.push(doc! { "$limit": limit }.into());
				}

				command.insert("pipeline", pipeline);
				command.insert("cursor", batch_size.map_or_else(Document::new, |n| doc! { "batchSize": n }));
			}
			CursorKind::ListIndexes | CursorKind::ListCollections => {
				command.insert("cursor", batch_size.map_or_else(Document::new, |n| doc! { "batchSize": n }));
			}
		}

		Ok(command)
	}

	fn apply_batch(&mut self, node: Arc<Node>, batch: CursorBatch) -> Result<()> {
		self.round_trips += 1;
		self.buffer.extend(batch.batch);
		self.state = match batch.id {
			0  => CursorState::Exhausted,
			id => CursorState::Open { node, id, ns: batch.ns.parse()? }
		};
		Ok(())
	}

	/// Returns the next document, fetching a batch if the buffer is empty.
	/// `None` marks the end of the sequence.
	pub async fn next(&mut self) -> Result<Option<Document>> {
		loop {
			if let Some(doc) = self.buffer.pop_front() {
				return Ok(Some(doc));
			}

			match &mut self.state {
				CursorState::Pending => {
					let command = self.initial_command()?;
					let (node, batch) = self.protocol.command_stream(&self.db, command, &self.read_preference).await?;
					self.apply_batch(node, batch)?;
				}
				CursorState::Open { node, id, ns } => {
					let (protocol, node, id, ns) = (self.protocol.clone(), node.clone(), *id, ns.clone());
					let batch_size = self.batch_size.map(|n| n as i32);
					let fetch = {
						let ns = ns.clone();
						task::spawn(async move {
							let batch = protocol.get_more(&node, id, &ns, batch_size).await;
							(node, batch)
						})
					};
					self.state = CursorState::Fetching { id, ns, fetch: GetMore(fetch.boxed()) };
				}
				CursorState::Fetching { fetch, .. } => {
					let (node, batch) = (&mut fetch.0).await;
					match batch {
						Ok(batch) => self.apply_batch(node, batch)?,
						Err(e) => {
							// the batch is lost, the cursor stays open so it can still be killed
							if let CursorState::Fetching { id, ns, .. } = std::mem::replace(&mut self.state, CursorState::Exhausted) {
								self.state = CursorState::Open { node, id, ns };
							}
							return Err(e);
						}
					}
				}
				CursorState::Exhausted | CursorState::Closed => return Ok(None)
			}
		}
	}

	/// Drains the cursor.
	pub async fn to_array(&mut self) -> Result<Vec<Document>> {
		let mut docs = Vec::new();
		while let Some(doc) = self.next().await? {
			docs.push(doc);
		}
		Ok(docs)
	}

	/// Kills the server side cursor if it is still open. Failures are logged, never returned.
	pub async fn close(&mut self) {
		self.buffer.clear();
		let state = std::mem::replace(&mut self.state, CursorState::Closed);

		let (node, id, ns) = match state {
			CursorState::Open { node, id, ns } => (node, id, ns),
			CursorState::Fetching { id, ns, fetch } => match async_std::future::timeout(self.kill_timeout, fetch.0).await {
				Ok((_, Ok(batch))) if batch.id == 0 => {
					debug!(cursor = id, %ns, "cursor exhausted while closing");
					return;
				}
				Ok((node, Ok(batch))) => (node, batch.id, ns),
				Ok((node, Err(_))) => (node, id, ns),
				Err(_) => {
					warn!(cursor = id, %ns, "timed out waiting for a get-more while closing");
					return;
				}
			},
			_ => return
		};

		let ids = [id];
		let kill = self.protocol.kill_cursors(&node, &ns, &ids);
		match async_std::future::timeout(self.kill_timeout, kill).await {
			Ok(Ok(())) => debug!(cursor = id, %ns, "cursor killed"),
			Ok(Err(e)) => warn!(cursor = id, %ns, error = %e, "failed to kill cursor"),
			Err(_) => warn!(cursor = id, %ns, "timed out killing cursor")
		}
	}

	/// A `Stream` over the remaining documents. The stream ends after the first error.
	pub fn into_stream(self) -> impl Stream<Item = Result<Document>> {
		stream::unfold(Some(self), |cursor| async move {
			let mut cursor = cursor?;
			match cursor.next().await {
				Ok(Some(doc)) => Some((Ok(doc), Some(cursor))),
				Ok(None) => None,
				Err(e) => Some((Err(e), None))
			}
		})
	}
}
