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

//! Connection pool for a single server.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst

use {
	crate::{*, apm::*, auth, common::{ConnectOptions, Credential, ServerAddress}, connection::Connection, wire::Message},
	std::{
		ops::Deref,
		sync::{Arc, Mutex, RwLock, atomic::{AtomicBool, AtomicU32, Ordering}}
	},
	async_std::channel::{self, Receiver, Sender},
	bson::Document,
	futures::future::join_all,
	tracing::{debug, warn}
};

/// Reusable connections to one address.
///
/// Capacity is enforced with a bounded channel pre-filled with one token per allowed connection.
/// A max pool size of zero means unbounded.
#[derive(Debug, Clone)]
pub struct Pool(Arc<PoolInner>);

#[derive(Debug)]
pub struct PoolInner {
	pub address: ServerAddress,
	options:     Arc<ConnectOptions>,
	monitor:     Arc<Monitor>,
	credential:  RwLock<Option<Credential>>,
	idle:        Mutex<Vec<Connection>>,
	permits:     Option<(Sender<()>, Receiver<()>)>,
	generation:  AtomicU32,
	closed:      AtomicBool
}

impl Deref for Pool {
	type Target = PoolInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

struct Permit(Option<Sender<()>>);

impl Drop for Permit {
	fn drop(&mut self) {
		if let Some(tx) = &self.0 {
			// fails only if the pool was closed
			let _ = tx.try_send(());
		}
	}
}

impl Pool {
	pub fn new(address: ServerAddress, options: Arc<ConnectOptions>, monitor: Arc<Monitor>) -> Self {
		let max = options.pool.max_pool_size;
		let permits = (max > 0).then(|| {
			let (tx, rx) = channel::bounded(max);
			for _ in 0..max {
				let _ = tx.try_send(());
			}
			(tx, rx)
		});

		monitor.emit(Event::PoolCreated { address: &address, max_pool_size: max });

		Self(Arc::new(PoolInner {
			credential: RwLock::new(options.credential.clone()),
			address,
			options,
			monitor,
			idle:       Mutex::new(Vec::new()),
			permits,
			generation: AtomicU32::new(0),
			closed:     AtomicBool::new(false)
		}))
	}

	/// Installs the credential every connection created from now on authenticates with.
	pub fn set_credential(&self, credential: Option<Credential>) -> Result<()> {
		*self.credential.write()? = credential;
		Ok(())
	}

	pub fn generation(&self) -> u32 {
		self.generation.load(Ordering::Acquire)
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	pub fn idle_count(&self) -> usize {
		self.idle.lock().map(|idle| idle.len()).unwrap_or_default()
	}

	/// Checks out a connection, reusing an idle one or opening a new one while under capacity.
	/// Waits for a release otherwise, failing with `PoolTimeout` after the wait queue timeout.
	pub async fn acquire(&self) -> Result<PooledConnection> {
		if self.is_closed() {
			return Err(Error::ClusterClosed);
		}

		self.monitor.emit(Event::ConnectionCheckOutStarted { address: &self.address });

		let permit = match &self.permits {
			None => Permit(None),
			Some((tx, rx)) => match async_std::future::timeout(self.options.pool.wait_queue_timeout, rx.recv()).await {
				Ok(Ok(())) => Permit(Some(tx.clone())),
				Ok(Err(_)) => {
					self.check_out_failed(ConnectionCheckOutFailedReason::PoolClosed);
					return Err(Error::ClusterClosed);
				}
				Err(_) => {
					self.check_out_failed(ConnectionCheckOutFailedReason::Timeout);
					return Err(Error::PoolTimeout(self.address.clone()));
				}
			}
		};

		let conn = match self.pop_idle()? {
			Some(conn) => conn,
			None => match self.open().await {
				Ok(conn) => conn,
				Err(e) => {
					self.check_out_failed(ConnectionCheckOutFailedReason::Error);
					return Err(e);
				}
			}
		};

		self.monitor.emit(Event::ConnectionCheckedOut { address: &self.address, connection_id: conn.id });

		Ok(PooledConnection {
			conn:      Some(conn),
			pool:      self.clone(),
			in_flight: false,
			_permit:   permit
		})
	}

	fn check_out_failed(&self, reason: ConnectionCheckOutFailedReason) {
		self.monitor.emit(Event::ConnectionCheckOutFailed { address: &self.address, reason });
	}

	fn pop_idle(&self) -> Result<Option<Connection>> {
		let generation = self.generation();
		let mut idle = self.idle.lock()?;

		while let Some(conn) = idle.pop() {
			let reason = if conn.generation != generation {
				ConnectionClosedReason::Stale
			} else if conn.is_broken() {
				ConnectionClosedReason::Error
			} else if self.options.pool.max_idle_time.map_or(false, |max| conn.idle_for() > max) {
				ConnectionClosedReason::Idle
			} else {
				return Ok(Some(conn));
			};

			self.close_connection(conn, reason);
		}

		Ok(None)
	}

	/// Opens, handshakes and authenticates a new connection.
	async fn open(&self) -> Result<Connection> {
		let mut conn = Connection::open(&self.address, &self.options).await?;
		conn.generation = self.generation();
		self.monitor.emit(Event::ConnectionCreated { address: &self.address, connection_id: conn.id });

		let handshake = match conn.handshake(&self.options).await {
			Ok(handshake) => handshake,
			Err(e) => {
				debug!(address = %self.address, connection = conn.id, error = %e, "handshake failed");
				self.close_connection(conn, ConnectionClosedReason::Error);
				return Err(e);
			}
		};
		let credential = self.credential.read()?.clone();
		if let Some(credential) = credential {
			if let Err(e) = auth::authenticate(&mut conn, &credential, &handshake).await {
				warn!(address = %self.address, connection = conn.id, error = %e, "authentication failed");
				self.close_connection(conn, ConnectionClosedReason::Error);
				return Err(e);
			}
		}

		self.monitor.emit(Event::ConnectionReady { address: &self.address, connection_id: conn.id });
		Ok(conn)
	}

	fn close_connection(&self, conn: Connection, reason: ConnectionClosedReason) {
		debug!(address = %self.address, connection = conn.id, ?reason, "discarding connection");
		self.monitor.emit(Event::ConnectionClosed { address: &self.address, connection_id: conn.id, reason });
		conn.close();
	}

	fn check_in(&self, mut conn: Connection) {
		let reason = if self.is_closed() {
			ConnectionClosedReason::PoolClosed
		} else if conn.generation != self.generation() {
			ConnectionClosedReason::Stale
		} else if conn.is_broken() {
			ConnectionClosedReason::Error
		} else {
			self.monitor.emit(Event::ConnectionCheckedIn { address: &self.address, connection_id: conn.id });
			conn.last_used = std::time::Instant::now();
			match self.idle.lock() {
				Ok(mut idle) => return idle.push(conn),
				Err(_) => ConnectionClosedReason::Error
			}
		};
		self.close_connection(conn, reason);
	}

	/// Opens connections until `min_pool_size` are available. Errors are logged, not returned.
	pub async fn fill(&self) {
		let min = self.options.pool.min_pool_size;
		if min == 0 || self.idle_count() >= min {
			return;
		}

		for result in join_all((0..min).map(|_| self.acquire())).await {
			if let Err(e) = result {
				debug!(address = %self.address, error = %e, "failed to pre-fill pool");
			}
		}
	}

	/// Invalidates every connection, including those currently checked out.
	pub fn clear(&self) {
		let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
		self.drain_idle(ConnectionClosedReason::Stale);
		self.monitor.emit(Event::PoolCleared { address: &self.address, generation });
	}

	pub fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		if let Some((_, rx)) = &self.permits {
			rx.close();
		}

		self.drain_idle(ConnectionClosedReason::PoolClosed);
		self.monitor.emit(Event::PoolClosed { address: &self.address });
	}

	fn drain_idle(&self, reason: ConnectionClosedReason) {
		let drained = match self.idle.lock() {
			Ok(mut idle) => std::mem::take(&mut *idle),
			Err(_) => return
		};

		for conn in drained {
			self.close_connection(conn, reason);
		}
	}
}

/// A checked out connection, returned to its pool on drop.
///
/// A connection dropped while a request is outstanding is discarded instead, its stream may
/// still carry the abandoned reply.
#[derive(Debug)]
pub struct PooledConnection {
	conn:      Option<Connection>,
	pool:      Pool,
	in_flight: bool,
	_permit:   Permit
}

impl std::fmt::Debug for Permit {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.write_str("Permit")
	}
}

impl PooledConnection {
	fn conn(&mut self) -> Result<&mut Connection> {
		self.conn.as_mut().ok_or(Error::ConnectionClosed)
	}

	pub fn id(&self) -> u64 {
		self.conn.as_ref().map_or(0, |conn| conn.id)
	}

	pub fn address(&self) -> &ServerAddress {
		&self.pool.address
	}

	pub fn generation(&self) -> u32 {
		self.conn.as_ref().map_or(0, |conn| conn.generation)
	}

	/// Sends one request and waits for its reply.
	pub async fn request(&mut self, msg: Message) -> Result<Message> {
		self.in_flight = true;
		let result = self.conn()?.request(msg).await;
		self.in_flight = false;
		result
	}

	/// Runs a command against `db` and checks the reply for errors.
	pub async fn run_command(&mut self, db: &str, command: Document) -> Result<Document> {
		self.in_flight = true;
		let result = self.conn()?.run_command(db, command).await;
		self.in_flight = false;
		result
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(mut conn) = self.conn.take() {
			if self.in_flight {
				conn.mark_broken();
			}
			self.pool.check_in(conn);
		}
	}
}
