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

//! An in-process server speaking OP_MSG on loopback, backing the network tests.
//!
//! It keeps collections in memory and understands the subset of commands the driver issues,
//! with just enough query semantics (equality and comparison filters, sorts, skip, limit) to
//! drive cursors end to end.

use {
	crate::{common::ServerAddress, wire::{self, read_message, Message, DEFAULT_MAX_MESSAGE_SIZE}},
	std::{
		cmp::Ordering,
		collections::{HashMap, VecDeque},
		sync::{Arc, Mutex},
		time::Duration
	},
	async_std::{net::{TcpListener, TcpStream}, task},
	bson::{doc, oid::ObjectId, Bson, Document},
	futures::{future::{AbortHandle, Abortable}, io::AsyncWriteExt}
};

const DEFAULT_BATCH_SIZE: usize = 101;

#[derive(Default)]
struct State {
	hello:        Document,
	users:        HashMap<String, String>,
	failures:     HashMap<String, VecDeque<Document>>,
	counts:       HashMap<String, usize>,
	commands:     Vec<Document>,
	connections:  usize,
	collections:  HashMap<String, Vec<Document>>,
	indexes:      HashMap<String, Vec<Document>>,
	delays:       HashMap<String, Duration>,
	cursors:      HashMap<i64, (String, VecDeque<Document>)>,
	next_cursor:  i64
}

fn default_hello() -> Document {
	doc! {
		"ok":                  1,
		"ismaster":            true,
		"minWireVersion":      0,
		"maxWireVersion":      17,
		"maxBsonObjectSize":   wire::DEFAULT_MAX_BSON_SIZE as i32,
		"maxMessageSizeBytes": wire::DEFAULT_MAX_MESSAGE_SIZE as i32,
		"maxWriteBatchSize":   wire::DEFAULT_MAX_BATCH_SIZE as i32
	}
}

#[derive(Default)]
pub struct StubServerBuilder {
	users: HashMap<String, String>
}

impl StubServerBuilder {
	/// Requires SCRAM authentication for `username`.
	pub fn user(mut self, username: &str, password: &str) -> Self {
		self.users.insert(username.to_string(), password.to_string());
		self
	}

	pub async fn start(self) -> StubServer {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let state = Arc::new(Mutex::new(State {
			hello:       default_hello(),
			users:       self.users,
			next_cursor: 1000,
			..State::default()
		}));

		let (handle, registration) = AbortHandle::new_pair();
		task::spawn(Abortable::new(accept_loop(listener, state.clone()), registration));

		StubServer { address: ServerAddress::new("127.0.0.1", port), state, handle }
	}
}

pub struct StubServer {
	address: ServerAddress,
	state:   Arc<Mutex<State>>,
	handle:  AbortHandle
}

impl StubServer {
	pub fn builder() -> StubServerBuilder {
		StubServerBuilder::default()
	}

	pub async fn start() -> Self {
		Self::builder().start().await
	}

	pub fn address(&self) -> ServerAddress {
		self.address.clone()
	}

	/// Connections accepted so far.
	pub fn connections(&self) -> usize {
		self.state.lock().unwrap().connections
	}

	/// How often a command named `name` was received.
	pub fn count(&self, name: &str) -> usize {
		self.state.lock().unwrap().counts.get(name).copied().unwrap_or_default()
	}

	/// Every command received, in order, with document sequences folded into the body.
	pub fn commands(&self) -> Vec<Document> {
		self.state.lock().unwrap().commands.clone()
	}

	pub fn last_command(&self, name: &str) -> Option<Document> {
		self.commands().into_iter().rev().find(|c| c.keys().next().map(String::as_str) == Some(name))
	}

	/// Merges `fields` into the handshake reply.
	pub fn set_hello(&self, fields: Document) {
		let mut state = self.state.lock().unwrap();
		for (k, v) in fields {
			state.hello.insert(k, v);
		}
	}

	/// Answers the next `name` command with `reply` instead of executing it. Queued per name.
	pub fn fail_next(&self, name: &str, reply: Document) {
		self.state.lock().unwrap().failures.entry(name.to_string()).or_default().push_back(reply);
	}

	/// Holds every later `name` command for `delay` before answering it.
	pub fn delay(&self, name: &str, delay: Duration) {
		self.state.lock().unwrap().delays.insert(name.to_string(), delay);
	}

	pub fn insert(&self, db: &str, coll: &str, docs: Vec<Document>) {
		self.state.lock().unwrap().collections
			.entry(format!("{}.{}", db, coll))
			.or_default()
			.extend(docs);
	}

	pub fn documents(&self, db: &str, coll: &str) -> Vec<Document> {
		self.state.lock().unwrap().collections.get(&format!("{}.{}", db, coll)).cloned().unwrap_or_default()
	}
}

impl Drop for StubServer {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

/// An address nothing listens on.
pub async fn unused_address() -> ServerAddress {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	drop(listener);
	ServerAddress::new("127.0.0.1", port)
}

async fn accept_loop(listener: TcpListener, state: Arc<Mutex<State>>) {
	let mut next_id = 1;
	while let Ok((stream, _)) = listener.accept().await {
		state.lock().unwrap().connections += 1;
		task::spawn(serve(stream, state.clone(), next_id));
		next_id += 1;
	}
}

#[derive(Default)]
struct Session {
	#[cfg(feature = "auth")]
	scram: Option<sasl::Conversation>
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>, connection_id: i32) {
	let mut session = Session::default();
	let mut request_id = connection_id << 16;

	while let Ok(request) = read_message(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await {
		let response_to = request.request_id;
		let command = request.into_document();

		let name = command.keys().next().cloned().unwrap_or_default();
		let delay = match name.as_str() {
			"sleep" => Some(Duration::from_millis(wire::get_int(&command, "millis").unwrap_or_default() as u64)),
			name    => state.lock().unwrap().delays.get(name).copied()
		};
		if let Some(delay) = delay {
			task::sleep(delay).await;
		}

		let body = handle(&mut state.lock().unwrap(), &mut session, command);
		let mut reply = Message::new(body);
		reply.request_id = request_id;
		reply.response_to = response_to;
		request_id += 1;

		let bytes = reply.encode(None).unwrap();
		if stream.write_all(&bytes).await.is_err() {
			break;
		}
	}
}

fn error(code: i32, message: &str) -> Document {
	doc! { "ok": 0.0, "errmsg": message, "code": code }
}

fn handle(state: &mut State, session: &mut Session, command: Document) -> Document {
	let name = command.keys().next().cloned().unwrap_or_default();
	*state.counts.entry(name.clone()).or_default() += 1;
	state.commands.push(command.clone());

	if let Some(reply) = state.failures.get_mut(&name).and_then(VecDeque::pop_front) {
		return reply;
	}

	let db = command.get_str("$db").unwrap_or("admin").to_string();
	let coll = command.get_str(&name).unwrap_or_default().to_string();
	let ns = format!("{}.{}", db, coll);

	match name.as_str() {
		"isMaster" | "ismaster" | "hello" => state.hello.clone(),
		"ping" | "sleep" | "endSessions" => doc! { "ok": 1 },
		"buildInfo" | "buildinfo" => doc! {
			"ok":                1,
			"version":           "7.0.0",
			"versionArray":      [7, 0, 0, 0],
			"maxBsonObjectSize": wire::DEFAULT_MAX_BSON_SIZE as i32
		},
		#[cfg(feature = "auth")]
		"saslStart" => {
			let (conversation, reply) = sasl::start(&state.users, &command);
			session.scram = conversation;
			reply
		}
		#[cfg(feature = "auth")]
		"saslContinue" => match session.scram.take() {
			Some(conversation) => sasl::finish(conversation, &command),
			None => error(17, "no conversation in progress")
		},
		"insert" => insert(state, &ns, &command),
		"find" => {
			let docs = query(
				state.collections.get(&ns).map(Vec::as_slice).unwrap_or_default(),
				command.get_document("filter").ok(),
				command.get_document("sort").ok(),
				wire::get_int(&command, "skip"),
				wire::get_int(&command, "limit")
			);
			open_cursor(state, ns, docs, wire::get_int(&command, "batchSize"), "firstBatch")
		}
		"aggregate" => {
			let docs = match aggregate(state, &db, &coll, &command) {
				Ok(docs) => docs,
				Err(reply) => return reply
			};
			let batch_size = command.get_document("cursor").ok().and_then(|c| wire::get_int(c, "batchSize"));
			open_cursor(state, ns, docs, batch_size, "firstBatch")
		}
		"getMore" => {
			let id = wire::get_int(&command, "getMore").unwrap_or_default();
			let batch_size = wire::get_int(&command, "batchSize").filter(|n| *n > 0).map(|n| n as usize);
			let (ns, remaining) = match state.cursors.get_mut(&id) {
				Some(cursor) => cursor,
				None => return error(43, "cursor not found")
			};
			let n = batch_size.unwrap_or(remaining.len()).min(remaining.len());
			let batch = remaining.drain(..n).collect::<Vec<_>>();
			let ns = ns.clone();
			let id = if remaining.is_empty() {
				state.cursors.remove(&id);
				0
			} else {
				id
			};
			doc! { "ok": 1, "cursor": { "id": id, "ns": ns, "nextBatch": batch } }
		}
		"killCursors" => {
			let ids = command.get_array("cursors").map(Vec::as_slice).unwrap_or_default();
			let killed = ids.iter()
				.filter_map(|id| match id {
					Bson::Int64(id) => Some(*id),
					Bson::Int32(id) => Some(*id as i64),
					_ => None
				})
				.filter(|id| state.cursors.remove(id).is_some())
				.collect::<Vec<_>>();
			doc! { "ok": 1, "cursorsKilled": killed }
		}
		"update" => update(state, &ns, &command),
		"delete" => {
			let mut n = 0;
			let deletes = command.get_array("deletes").cloned().unwrap_or_default();
			let docs = state.collections.entry(ns).or_default();
			for delete in deletes.iter().filter_map(Bson::as_document) {
				let filter = delete.get_document("q").ok();
				let single = wire::get_int(delete, "limit") == Some(1);
				while let Some(i) = docs.iter().position(|d| matches(d, filter)) {
					docs.remove(i);
					n += 1;
					if single {
						break;
					}
				}
			}
			doc! { "ok": 1, "n": n }
		}
		"findAndModify" | "findandmodify" => find_and_modify(state, &ns, &command),
		"count" => {
			let docs = query(
				state.collections.get(&ns).map(Vec::as_slice).unwrap_or_default(),
				command.get_document("query").ok(),
				None,
				wire::get_int(&command, "skip"),
				wire::get_int(&command, "limit")
			);
			doc! { "ok": 1, "n": docs.len() as i32 }
		}
		"distinct" => {
			let key = command.get_str("key").unwrap_or_default();
			let filter = command.get_document("query").ok();
			let mut values = Vec::<Bson>::new();
			for doc in state.collections.get(&ns).map(Vec::as_slice).unwrap_or_default() {
				match (matches(doc, filter), doc.get(key)) {
					(true, Some(v)) if !values.contains(v) => values.push(v.clone()),
					_ => ()
				}
			}
			doc! { "ok": 1, "values": values }
		}
		"listIndexes" => if state.collections.contains_key(&ns) || state.indexes.contains_key(&ns) {
			let specs = indexes(state, &ns);
			let batch_size = command.get_document("cursor").ok().and_then(|c| wire::get_int(c, "batchSize"));
			open_cursor(state, ns, specs, batch_size, "firstBatch")
		} else {
			error(26, "ns does not exist")
		},
		"createIndexes" => {
			state.collections.entry(ns.clone()).or_default();
			let before = indexes(state, &ns).len() as i32;
			let specs = command.get_array("indexes").cloned().unwrap_or_default();
			let existing = state.indexes.entry(ns.clone()).or_default();
			for spec in specs.into_iter().filter_map(|s| s.as_document().cloned()) {
				if !existing.iter().any(|e| e.get("name") == spec.get("name")) {
					existing.push(spec);
				}
			}
			let after = indexes(state, &ns).len() as i32;
			doc! { "ok": 1, "numIndexesBefore": before, "numIndexesAfter": after }
		}
		"dropIndexes" => {
			let index = command.get("index").cloned().unwrap_or(Bson::Null);
			if let Some(existing) = state.indexes.get_mut(&ns) {
				match index {
					Bson::String(name) if name == "*" => existing.clear(),
					Bson::String(name) => existing.retain(|e| e.get_str("name").ok() != Some(name.as_str())),
					_ => ()
				}
			}
			doc! { "ok": 1 }
		}
		"listCollections" => {
			let prefix = format!("{}.", db);
			let mut names = state.collections.keys()
				.filter_map(|ns| ns.strip_prefix(&prefix))
				.map(str::to_string)
				.collect::<Vec<_>>();
			names.sort();
			let docs = names.into_iter()
				.map(|name| doc! { "name": name, "type": "collection" })
				.filter(|d| matches(d, command.get_document("filter").ok()))
				.collect();
			let batch_size = command.get_document("cursor").ok().and_then(|c| wire::get_int(c, "batchSize"));
			open_cursor(state, format!("{}.$cmd.listCollections", db), docs, batch_size, "firstBatch")
		}
		"listDatabases" => {
			let mut names = state.collections.keys()
				.filter_map(|ns| ns.split_once('.').map(|(db, _)| db.to_string()))
				.collect::<Vec<_>>();
			names.sort();
			names.dedup();
			let databases = names.into_iter()
				.map(|name| doc! { "name": name, "sizeOnDisk": 0, "empty": false })
				.collect::<Vec<_>>();
			doc! { "ok": 1, "databases": databases, "totalSize": 0 }
		}
		"drop" => {
			state.collections.remove(&ns);
			state.indexes.remove(&ns);
			doc! { "ok": 1, "ns": ns }
		}
		"dropDatabase" => {
			let prefix = format!("{}.", db);
			state.collections.retain(|ns, _| !ns.starts_with(&prefix));
			state.indexes.retain(|ns, _| !ns.starts_with(&prefix));
			doc! { "ok": 1, "dropped": db }
		}
		_ => doc! { "ok": 1 }
	}
}

fn indexes(state: &State, ns: &str) -> Vec<Document> {
	let mut indexes = vec![doc! { "v": 2, "key": { "_id": 1 }, "name": "_id_" }];
	indexes.extend(state.indexes.get(ns).cloned().unwrap_or_default());
	indexes
}

fn open_cursor(state: &mut State, ns: String, mut docs: Vec<Document>, batch_size: Option<i64>, field: &str) -> Document {
	let n = batch_size
		.filter(|n| *n > 0)
		.map_or(DEFAULT_BATCH_SIZE, |n| n as usize)
		.min(docs.len());
	let remaining = docs.split_off(n);

	let id = if remaining.is_empty() {
		0
	} else {
		let id = state.next_cursor;
		state.next_cursor += 1;
		state.cursors.insert(id, (ns.clone(), remaining.into()));
		id
	};

	let mut cursor = doc! { "id": id, "ns": ns };
	cursor.insert(field, docs);
	doc! { "ok": 1, "cursor": cursor }
}

fn insert(state: &mut State, ns: &str, command: &Document) -> Document {
	let ordered = command.get_bool("ordered").unwrap_or(true);
	let docs = state.collections.entry(ns.to_string()).or_default();
	let mut n = 0;
	let mut write_errors = Vec::new();

	for (index, doc) in command.get_array("documents").cloned().unwrap_or_default().into_iter().enumerate() {
		let mut doc = match doc {
			Bson::Document(doc) => doc,
			_ => continue
		};
		if !doc.contains_key("_id") {
			doc.insert("_id", ObjectId::new());
		}

		if docs.iter().any(|d| d.get("_id") == doc.get("_id")) {
			write_errors.push(doc! {
				"index":  index as i32,
				"code":   11000,
				"errmsg": format!("E11000 duplicate key error collection: {}", ns)
			});
			if ordered {
				break;
			}
			continue;
		}

		docs.push(doc);
		n += 1;
	}

	let mut reply = doc! { "ok": 1, "n": n };
	if !write_errors.is_empty() {
		reply.insert("writeErrors", write_errors);
	}
	reply
}

fn update(state: &mut State, ns: &str, command: &Document) -> Document {
	let docs = state.collections.entry(ns.to_string()).or_default();
	let mut n = 0;
	let mut modified = 0;
	let mut upserted = Vec::new();

	for (index, update) in command.get_array("updates").cloned().unwrap_or_default().iter().enumerate() {
		let update = match update.as_document() {
			Some(update) => update,
			None => continue
		};
		let filter = update.get_document("q").ok();
		let spec = update.get_document("u").cloned().unwrap_or_default();
		let multi = update.get_bool("multi").unwrap_or(false);

		let mut matched = false;
		for doc in docs.iter_mut().filter(|d| matches(d, filter)) {
			matched = true;
			n += 1;
			let updated = apply_update(doc, &spec);
			if updated != *doc {
				*doc = updated;
				modified += 1;
			}
			if !multi {
				break;
			}
		}

		if !matched && update.get_bool("upsert").unwrap_or(false) {
			let doc = upsert(filter, &spec);
			upserted.push(doc! { "index": index as i32, "_id": doc.get("_id").cloned().unwrap_or(Bson::Null) });
			docs.push(doc);
			n += 1;
		}
	}

	let mut reply = doc! { "ok": 1, "n": n, "nModified": modified };
	if !upserted.is_empty() {
		reply.insert("upserted", upserted);
	}
	reply
}

fn upsert(filter: Option<&Document>, spec: &Document) -> Document {
	let mut seed = filter.map_or_else(Document::new, |f| {
		f.iter()
			.filter(|(k, v)| !k.starts_with('$') && !matches!(v, Bson::Document(d) if is_operator(d)))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect()
	});
	if !seed.contains_key("_id") {
		seed.insert("_id", ObjectId::new());
	}
	apply_update(&seed, spec)
}

fn find_and_modify(state: &mut State, ns: &str, command: &Document) -> Document {
	let docs = state.collections.entry(ns.to_string()).or_default();
	let filter = command.get_document("query").ok();
	let return_new = command.get_bool("new").unwrap_or(false);

	let mut candidates = docs.iter().enumerate().filter(|(_, d)| matches(d, filter)).collect::<Vec<_>>();
	if let Ok(sort) = command.get_document("sort") {
		candidates.sort_by(|(_, a), (_, b)| compare_by(a, b, sort));
	}
	let position = candidates.first().map(|(i, _)| *i);

	if command.get_bool("remove").unwrap_or(false) {
		return match position {
			Some(i) => doc! { "ok": 1, "value": docs.remove(i), "lastErrorObject": { "n": 1 } },
			None => doc! { "ok": 1, "value": Bson::Null, "lastErrorObject": { "n": 0 } }
		};
	}

	let spec = command.get_document("update").cloned().unwrap_or_default();
	match position {
		Some(i) => {
			let old = docs[i].clone();
			docs[i] = apply_update(&old, &spec);
			let value = if return_new { docs[i].clone() } else { old };
			doc! { "ok": 1, "value": value, "lastErrorObject": { "n": 1, "updatedExisting": true } }
		}
		None if command.get_bool("upsert").unwrap_or(false) => {
			let doc = upsert(filter, &spec);
			docs.push(doc.clone());
			let value = if return_new { Bson::Document(doc) } else { Bson::Null };
			doc! { "ok": 1, "value": value, "lastErrorObject": { "n": 1, "updatedExisting": false } }
		}
		None => doc! { "ok": 1, "value": Bson::Null, "lastErrorObject": { "n": 0, "updatedExisting": false } }
	}
}

fn aggregate(state: &State, db: &str, coll: &str, command: &Document) -> Result<Vec<Document>, Document> {
	let mut docs = state.collections.get(&format!("{}.{}", db, coll)).cloned().unwrap_or_default();

	for stage in command.get_array("pipeline").map(Vec::as_slice).unwrap_or_default() {
		let (name, arg) = match stage.as_document().and_then(|s| s.iter().next()) {
			Some(stage) => stage,
			None => return Err(error(40323, "a pipeline stage must be a document with one field"))
		};

		docs = match (name.as_str(), arg) {
			("$match", Bson::Document(filter)) => docs.into_iter().filter(|d| matches(d, Some(filter))).collect(),
			("$sort", Bson::Document(sort)) => {
				docs.sort_by(|a, b| compare_by(a, b, sort));
				docs
			}
			("$skip", n) => docs.into_iter().skip(as_int(n).unwrap_or_default() as usize).collect(),
			("$limit", n) => docs.into_iter().take(as_int(n).unwrap_or_default() as usize).collect(),
			("$collStats", _) => vec![doc! { "ns": format!("{}.{}", db, coll), "count": docs.len() as i32 }],
			("$group", Bson::Document(spec)) => group(docs, spec)?,
			(name, _) => return Err(error(40324, &format!("unrecognized pipeline stage name: '{}'", name)))
		};
	}

	Ok(docs)
}

/// Supports grouping by a constant or a `$field` path with `{ $sum: <number> }` accumulators.
fn group(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>, Document> {
	let key_of = |doc: &Document| match spec.get("_id") {
		Some(Bson::String(path)) if path.starts_with('$') => doc.get(&path[1..]).cloned().unwrap_or(Bson::Null),
		Some(key) => key.clone(),
		None => Bson::Null
	};

	let mut groups: Vec<(Bson, Document)> = Vec::new();
	for doc in &docs {
		let key = key_of(doc);
		let i = match groups.iter().position(|(k, _)| *k == key) {
			Some(i) => i,
			None => {
				groups.push((key.clone(), doc! { "_id": key }));
				groups.len() - 1
			}
		};

		for (field, accumulator) in spec.iter().filter(|(k, _)| *k != "_id") {
			let amount = match accumulator.as_document().and_then(|a| a.get("$sum")) {
				Some(Bson::String(path)) if path.starts_with('$') => doc.get(&path[1..]).and_then(as_int).unwrap_or_default(),
				Some(n) => as_int(n).unwrap_or_default(),
				None => return Err(error(15952, "unknown group operator"))
			};
			let current = groups[i].1.get(field).and_then(as_int).unwrap_or_default();
			groups[i].1.insert(field.clone(), (current + amount) as i32);
		}
	}

	Ok(groups.into_iter().map(|(_, doc)| doc).collect())
}

fn query(docs: &[Document], filter: Option<&Document>, sort: Option<&Document>, skip: Option<i64>, limit: Option<i64>) -> Vec<Document> {
	let mut docs = docs.iter().filter(|d| matches(d, filter)).cloned().collect::<Vec<_>>();
	if let Some(sort) = sort {
		docs.sort_by(|a, b| compare_by(a, b, sort));
	}

	let docs = docs.into_iter().skip(skip.unwrap_or_default().max(0) as usize);
	match limit.map(i64::abs).filter(|l| *l > 0) {
		Some(limit) => docs.take(limit as usize).collect(),
		None => docs.collect()
	}
}

fn as_int(value: &Bson) -> Option<i64> {
	match value {
		Bson::Int32(v)  => Some(*v as i64),
		Bson::Int64(v)  => Some(*v),
		Bson::Double(v) => Some(*v as i64),
		_               => None
	}
}

fn is_operator(doc: &Document) -> bool {
	doc.keys().next().map_or(false, |k| k.starts_with('$'))
}

fn matches(doc: &Document, filter: Option<&Document>) -> bool {
	filter.map_or(true, |filter| filter.iter().all(|(key, condition)| {
		let value = doc.get(key);
		match condition {
			Bson::Document(ops) if is_operator(ops) => ops.iter().all(|(op, arg)| {
				let ordering = compare(value, Some(arg));
				match op.as_str() {
					"$eq"  => ordering == Ordering::Equal,
					"$ne"  => ordering != Ordering::Equal,
					"$gt"  => value.is_some() && ordering == Ordering::Greater,
					"$gte" => value.is_some() && ordering != Ordering::Less,
					"$lt"  => value.is_some() && ordering == Ordering::Less,
					"$lte" => value.is_some() && ordering != Ordering::Greater,
					"$in"  => arg.as_array().map_or(false, |a| a.iter().any(|v| compare(value, Some(v)) == Ordering::Equal)),
					"$exists" => value.is_some() == arg.as_bool().unwrap_or(true),
					_ => false
				}
			}),
			condition => match value {
				Some(Bson::Array(values)) => values.iter().any(|v| compare(Some(v), Some(condition)) == Ordering::Equal),
				value => compare(value, Some(condition)) == Ordering::Equal
			}
		}
	}))
}

fn compare_by(a: &Document, b: &Document, sort: &Document) -> Ordering {
	sort.iter()
		.map(|(key, direction)| {
			let ordering = compare(a.get(key), b.get(key));
			if as_int(direction).unwrap_or(1) < 0 { ordering.reverse() } else { ordering }
		})
		.find(|o| *o != Ordering::Equal)
		.unwrap_or(Ordering::Equal)
}

fn compare(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
	fn rank(v: Option<&Bson>) -> u8 {
		match v {
			None | Some(Bson::Null)                                => 0,
			Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => 1,
			Some(Bson::String(_))                                  => 2,
			Some(Bson::Document(_))                                => 3,
			Some(Bson::Array(_))                                   => 4,
			Some(Bson::ObjectId(_))                                => 7,
			Some(Bson::Boolean(_))                                 => 8,
			Some(Bson::DateTime(_))                                => 9,
			Some(_)                                                => 10
		}
	}

	match (a, b) {
		(Some(Bson::String(a)), Some(Bson::String(b))) => a.cmp(b),
		(Some(Bson::ObjectId(a)), Some(Bson::ObjectId(b))) => a.bytes().cmp(&b.bytes()),
		(Some(Bson::Boolean(a)), Some(Bson::Boolean(b))) => a.cmp(b),
		(Some(Bson::DateTime(a)), Some(Bson::DateTime(b))) => a.cmp(b),
		(Some(a), Some(b)) if rank(Some(a)) == 1 && rank(Some(b)) == 1 => {
			let (a, b) = (to_f64(a), to_f64(b));
			a.partial_cmp(&b).unwrap_or(Ordering::Equal)
		}
		(a, b) if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
		(Some(a), Some(b)) if a == b => Ordering::Equal,
		(Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
		_ => Ordering::Equal
	}
}

fn to_f64(v: &Bson) -> f64 {
	match v {
		Bson::Int32(v)  => *v as f64,
		Bson::Int64(v)  => *v as f64,
		Bson::Double(v) => *v,
		_               => f64::NAN
	}
}

fn apply_update(doc: &Document, spec: &Document) -> Document {
	if !is_operator(spec) {
		let mut replacement = spec.clone();
		if let Some(id) = doc.get("_id") {
			replacement.insert("_id", id.clone());
		}
		return replacement;
	}

	let mut doc = doc.clone();
	for (op, fields) in spec {
		let fields = match fields.as_document() {
			Some(fields) => fields,
			None => continue
		};
		for (key, value) in fields {
			match op.as_str() {
				"$set" => { doc.insert(key.clone(), value.clone()); }
				"$setOnInsert" => if !doc.contains_key(key) {
					doc.insert(key.clone(), value.clone());
				},
				"$unset" => { doc.remove(key); }
				"$inc" => {
					let sum = match (doc.get(key), value) {
						(None, v) => v.clone(),
						(Some(Bson::Int32(a)), Bson::Int32(b)) => Bson::Int32(a + b),
						(Some(a), b) if matches!(a, Bson::Double(_)) || matches!(b, Bson::Double(_)) => Bson::Double(to_f64(a) + to_f64(b)),
						(Some(a), b) => Bson::Int64(as_int(a).unwrap_or_default() + as_int(b).unwrap_or_default())
					};
					doc.insert(key.clone(), sum);
				}
				"$push" => {
					let mut values = doc.get_array(key).cloned().unwrap_or_default();
					values.push(value.clone());
					doc.insert(key.clone(), values);
				}
				_ => ()
			}
		}
	}
	doc
}

#[cfg(feature = "auth")]
mod sasl {
	use {
		super::*,
		crate::auth::scram::{ScramVersion, MIN_ITERATIONS},
		base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
		bson::{spec::BinarySubtype, Binary}
	};

	const SALT: &[u8] = b"stub-server-salt";
	const SERVER_NONCE: &str = "c3R1Yi1zZXJ2ZXItbm9uY2U";

	pub struct Conversation {
		version:           ScramVersion,
		client_first_bare: String,
		server_first:      String,
		salted_password:   Option<Vec<u8>>
	}

	fn attribute(message: &str, key: char) -> Option<&str> {
		message.split(',').find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
	}

	fn payload(command: &Document) -> Option<String> {
		command.get_binary_generic("payload").ok().and_then(|p| String::from_utf8(p.clone()).ok())
	}

	fn reply(done: bool, payload: String) -> Document {
		doc! {
			"ok":             1,
			"conversationId": 1,
			"done":           done,
			"payload":        Binary { subtype: BinarySubtype::Generic, bytes: payload.into_bytes() }
		}
	}

	fn auth_failed() -> Document {
		doc! { "ok": 0.0, "errmsg": "Authentication failed.", "code": 18, "codeName": "AuthenticationFailed" }
	}

	pub fn start(users: &HashMap<String, String>, command: &Document) -> (Option<Conversation>, Document) {
		let version = match command.get_str("mechanism") {
			Ok("SCRAM-SHA-1")   => ScramVersion::Sha1,
			Ok("SCRAM-SHA-256") => ScramVersion::Sha256,
			_ => return (None, error(2, "unsupported mechanism"))
		};

		let client_first_bare = match payload(command).and_then(|p| p.strip_prefix("n,,").map(str::to_string)) {
			Some(bare) => bare,
			None => return (None, auth_failed())
		};
		let (user, nonce) = match (attribute(&client_first_bare, 'n'), attribute(&client_first_bare, 'r')) {
			(Some(user), Some(nonce)) => (user.to_string(), nonce.to_string()),
			_ => return (None, auth_failed())
		};

		let salted_password = users.get(&user).map(|password| {
			version.hi(version.prepare_password(&user, password).as_bytes(), SALT, MIN_ITERATIONS).unwrap()
		});
		let server_first = format!("r={}{},s={},i={}", nonce, SERVER_NONCE, BASE64.encode(SALT), MIN_ITERATIONS);

		let reply = reply(false, server_first.clone());
		(Some(Conversation { version, client_first_bare, server_first, salted_password }), reply)
	}

	pub fn finish(conversation: Conversation, command: &Document) -> Document {
		let client_final = match payload(command) {
			Some(p) => p,
			None => return auth_failed()
		};
		let (without_proof, proof) = match client_final.rsplit_once(",p=") {
			Some((without_proof, proof)) => (without_proof, BASE64.decode(proof).unwrap_or_default()),
			None => return auth_failed()
		};
		let salted_password = match conversation.salted_password {
			Some(salted_password) => salted_password,
			None => return auth_failed()
		};

		let v = conversation.version;
		let auth_message = format!("{},{},{}", conversation.client_first_bare, conversation.server_first, without_proof);
		let client_key = v.hmac(&salted_password, b"Client Key").unwrap();
		let client_signature = v.hmac(&v.hash(&client_key), auth_message.as_bytes()).unwrap();
		let expected = client_key.iter().zip(&client_signature).map(|(k, s)| k ^ s).collect::<Vec<_>>();

		if proof != expected {
			return auth_failed();
		}

		let server_key = v.hmac(&salted_password, b"Server Key").unwrap();
		let signature = v.hmac(&server_key, auth_message.as_bytes()).unwrap();
		reply(true, format!("v={}", BASE64.encode(signature)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn filters_and_sorts() {
		let docs = vec![
			doc! { "name": "a", "age": 30 },
			doc! { "name": "b", "age": 20_i64 },
			doc! { "name": "c", "age": 25.0, "tags": ["x", "y"] }
		];

		let names = |docs: Vec<Document>| docs.iter().map(|d| d.get_str("name").unwrap().to_string()).collect::<Vec<_>>();
		assert_eq!(names(query(&docs, Some(&doc! { "age": { "$gte": 25 } }), Some(&doc! { "age": 1 }), None, None)), ["c", "a"]);
		assert_eq!(names(query(&docs, Some(&doc! { "tags": "y" }), None, None, None)), ["c"]);
		assert_eq!(names(query(&docs, None, Some(&doc! { "name": -1 }), Some(1), Some(1))), ["b"]);
	}

	#[test]
	fn update_operators() {
		let doc = doc! { "_id": 1, "n": 1, "gone": true };
		let updated = apply_update(&doc, &doc! { "$inc": { "n": 2 }, "$set": { "x": "y" }, "$unset": { "gone": "" } });
		assert_eq!(updated, doc! { "_id": 1, "n": 3, "x": "y" });
		assert_eq!(apply_update(&doc, &doc! { "other": 1 }), doc! { "other": 1, "_id": 1 });
	}
}
