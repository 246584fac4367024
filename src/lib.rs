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

//! An asynchronous client for document databases speaking the MongoDB wire protocol.
//!
//! ```no_run
//! # async fn run() -> mongo_wire_client::Result<()> {
//! use {mongo_wire_client::Client, bson::doc};
//!
//! let client = Client::new();
//! let db = client.connect("mongodb://localhost:27017/shop").await?;
//! db.collection("orders").insert_one(doc! { "item": "book" }).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![forbid(unsafe_code)]

use {
	self::{apm::Monitor, protocol::WireProtocol, topology::Cluster},
	std::{
		collections::HashMap,
		sync::{Arc, Mutex, RwLock, atomic::{AtomicUsize, Ordering}}
	},
	bson::{doc, Document},
	futures::future::{BoxFuture, FutureExt, Shared},
	tracing::{debug, info, warn}
};

pub use self::{
	error::{Error, Result},
	common::{AuthMech, ConnectOptions, Credential, ReadPreference, ReadPreferenceMode, ServerAddress, WriteConcern},
	db::Database,
	coll::*,
	cursor::{Cursor, CursorKind}
};

pub mod error;
pub mod common;
pub mod wire;
pub mod connection;
pub mod auth;
pub mod apm;
pub mod pool;
pub mod topology;
pub mod protocol;
pub mod cursor;
pub mod db;
pub mod coll;
#[cfg(test)]
pub(crate) mod testing;

pub static DRIVER_NAME: &str = "mongo-wire-client";

type PendingConnect = Shared<BoxFuture<'static, Result<Database>>>;

/// Anything a connection can be configured from.
pub trait IntoConnectOptions {
	fn into_connect_options(self) -> Result<ConnectOptions>;
}

impl IntoConnectOptions for ConnectOptions {
	fn into_connect_options(self) -> Result<ConnectOptions> {
		Ok(self)
	}
}

impl IntoConnectOptions for &str {
	fn into_connect_options(self) -> Result<ConnectOptions> {
		self.parse()
	}
}

impl IntoConnectOptions for String {
	fn into_connect_options(self) -> Result<ConnectOptions> {
		self.parse()
	}
}

/// The deployment the client talks to, set by the last successful `connect`.
#[derive(Debug, Clone)]
struct Session {
	key:        String,
	db:         String,
	protocol:   WireProtocol,
	build_info: Document
}

/// Entry point of the driver. Cheap to clone, clones share connections and caches.
#[derive(Debug, Clone, Default)]
pub struct Client(Arc<ClientInner>);

#[derive(Default)]
pub struct ClientInner {
	monitor:   Arc<Monitor>,
	session:   RwLock<Option<Session>>,
	clusters:  Mutex<Vec<Cluster>>,
	pending:   Mutex<HashMap<String, (ConnectOptions, PendingConnect)>>,
	databases: Mutex<HashMap<(String, String), Database>>,
	connected: AtomicUsize
}

impl std::ops::Deref for Client {
	type Target = ClientInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl std::fmt::Debug for ClientInner {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("ClientInner")
			.field("monitor", &self.monitor)
			.field("session", &self.session)
			.field("connected", &self.connected)
			.finish()
	}
}

impl Client {
	pub fn new() -> Self {
		Self::default()
	}

	/// Connects to the deployment described by `options` and returns its default database.
	///
	/// Concurrent calls for the same set of servers share one attempt and one cluster.
	/// A failed attempt is forgotten, so it can be retried.
	pub async fn connect(&self, options: impl IntoConnectOptions) -> Result<Database> {
		let options = options.into_connect_options()?;
		let key = options.cache_key();

		let attempt = {
			let mut pending = self.pending.lock()?;
			match pending.get(&key) {
				Some((existing, attempt)) => {
					if *existing != options {
						warn!(servers = %key, "reusing an existing connection, the new options are ignored");
					}
					attempt.clone()
				}
				None => {
					let client = self.clone();
					let attempt = {
						let options = options.clone();
						async move { client.connect_cluster(options).await }.boxed().shared()
					};
					pending.insert(key.clone(), (options, attempt.clone()));
					self.connected.fetch_add(1, Ordering::AcqRel);
					attempt
				}
			}
		};

		let result = attempt.clone().await;
		if result.is_err() {
			let mut pending = self.pending.lock()?;
			if pending.get(&key).map_or(false, |(_, a)| a.ptr_eq(&attempt)) {
				pending.remove(&key);
				self.connected.fetch_sub(1, Ordering::AcqRel);
			}
		}
		result
	}

	async fn connect_cluster(&self, options: ConnectOptions) -> Result<Database> {
		let key = options.cache_key();
		let db = options.db.clone();
		info!(servers = %key, "connecting");

		let cluster = Cluster::new(options, self.monitor.clone());
		cluster.connect().await?;

		let protocol = WireProtocol::new(cluster.clone(), self.monitor.clone());
		let build_info = match protocol.command_single(&db, doc! { "buildInfo": 1 }).await {
			Ok(build_info) => build_info,
			Err(e) => {
				let _ = cluster.close().await;
				return Err(e);
			}
		};
		debug!(servers = %key, version = build_info.get_str("version").unwrap_or("unknown"), "connected");

		self.clusters.lock()?.push(cluster);
		let session = Session { key, db, protocol, build_info };
		let database = self.database_in(&session, &session.db)?;
		*self.session.write()? = Some(session);
		Ok(database)
	}

	fn session(&self) -> Result<Session> {
		self.session.read()?.clone().ok_or(Error::IllegalState("the client is not connected"))
	}

	fn database_in(&self, session: &Session, name: &str) -> Result<Database> {
		let mut databases = self.databases.lock()?;
		let database = databases.entry((session.key.clone(), name.to_string())).or_insert_with(|| {
			let options = &session.protocol.cluster().options;
			Database::new(session.protocol.clone(), name, options.read_preference, options.write_concern)
		});
		Ok(database.clone())
	}

	/// The number of distinct deployments connected to, in-flight attempts included.
	pub fn connected_count(&self) -> usize {
		self.connected.load(Ordering::Acquire)
	}

	/// The `buildInfo` reply fetched right after connecting.
	pub fn build_info(&self) -> Option<Document> {
		self.session().ok().map(|s| s.build_info)
	}

	/// The database named in the connection string, `admin` if it named none.
	pub fn database(&self) -> Result<Database> {
		let session = self.session()?;
		self.database_in(&session, &session.db)
	}

	/// Returns the handle for `name`, the same one on every call.
	pub fn db(&self, name: &str) -> Result<Database> {
		self.database_in(&self.session()?, name)
	}

	pub async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
		self.session()?.protocol.command_single(db, command).await
	}

	pub async fn list_databases(&self) -> Result<Vec<Document>> {
		let reply = self.run_command("admin", doc! { "listDatabases": 1 }).await?;
		Ok(reply.get_array("databases")
			.map(|databases| databases.iter().filter_map(|d| d.as_document().cloned()).collect())
			.unwrap_or_default())
	}

	/// Registers a listener for command and connection pool events.
	pub fn add_listener(&self, listener: apm::EventListener) {
		self.monitor.add_listener(listener);
	}

	/// Closes every cluster and clears all caches. Handles obtained earlier fail with `ClusterClosed`.
	pub async fn close(&self) -> Result<()> {
		let clusters = std::mem::take(&mut *self.clusters.lock()?);
		*self.session.write()? = None;
		self.pending.lock()?.clear();
		self.databases.lock()?.clear();
		self.connected.store(0, Ordering::Release);

		for cluster in clusters {
			cluster.close().await?;
		}
		Ok(())
	}
}
