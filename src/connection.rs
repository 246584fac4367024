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
	crate::{*, common::{ConnectOptions, ServerAddress}, error::ProtocolError, wire::*},
	std::{
		collections::HashMap,
		sync::{Arc, Mutex, atomic::{AtomicU64, Ordering}},
		time::{Duration, Instant}
	},
	async_std::{net::TcpStream, task},
	bson::Document,
	futures::{
		channel::oneshot,
		future::{AbortHandle, Abortable},
		io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt}
	},
	tracing::{debug, error, trace}
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type PendingReply = oneshot::Sender<Result<Message>>;

#[derive(Default)]
struct Pending {
	slots:  HashMap<i32, PendingReply>,
	/// Set once the receive loop ended, new requests fail with this error.
	closed: Option<Error>
}

impl Pending {
	fn fail_all(&mut self, error: Error) {
		for (_, slot) in self.slots.drain() {
			let _ = slot.send(Err(error.clone()));
		}
		self.closed.get_or_insert(error);
	}
}

/// One physical link to a single server.
///
/// Requests are written by the owner, replies are read by a background task
/// and routed to the waiting request by their `response_to` id.
pub struct Connection {
	pub id:                      u64,
	pub address:                 ServerAddress,
	pub(crate) generation:       u32,
	pub(crate) last_used:        Instant,
	writer:                      Box<dyn AsyncWrite + Send + Unpin>,
	pending:                     Arc<Mutex<Pending>>,
	receiver:                    AbortHandle,
	next_request_id:             i32,
	compressor:                  Option<Compressor>,
	max_message_size:            usize,
	broken:                      bool
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("id", &self.id)
			.field("address", &self.address)
			.field("generation", &self.generation)
			.field("broken", &self.broken)
			.finish()
	}
}

impl Connection {
	/// Opens a TCP (or TLS) connection. No handshake is performed.
	pub async fn open(address: &ServerAddress, options: &ConnectOptions) -> Result<Self> {
		let tcp = async_std::io::timeout(
			options.connect_timeout,
			TcpStream::connect((address.host.as_str(), address.port))
		).await?;
		tcp.set_nodelay(true)?;

		match &options.tls {
			None => Ok(Self::from_stream(address.clone(), tcp)),
			#[cfg(feature = "tls")]
			Some(tls) => {
				let stream = tls::connector(tls)?.connect(&address.host, tcp).await?;
				Ok(Self::from_stream(address.clone(), stream))
			}
			#[cfg(not(feature = "tls"))]
			Some(_) => Err(Error::invalid_options("TLS requested, but the `tls` feature is disabled"))
		}
	}

	fn from_stream<S: AsyncRead + AsyncWrite + Send + Unpin + 'static>(address: ServerAddress, stream: S) -> Self {
		let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
		let (reader, writer) = stream.split();
		let pending = Arc::new(Mutex::new(Pending::default()));
		let (receiver, registration) = AbortHandle::new_pair();

		task::spawn(Abortable::new(
			receive_loop(id, address.clone(), reader, pending.clone()),
			registration
		));

		debug!(connection = id, %address, "connection opened");

		Self {
			id,
			address,
			generation:       0,
			last_used:        Instant::now(),
			writer:           Box::new(writer),
			pending,
			receiver,
			next_request_id:  1,
			compressor:       None,
			max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
			broken:           false
		}
	}

	/// Performs the initial handshake, negotiating compression.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
	pub async fn handshake(&mut self, options: &ConnectOptions) -> Result<HandshakeReply> {
		let request = HandshakeRequest::new(options).to_document()?;
		let reply = HandshakeReply::from_document(self.run_command("admin", request).await?)?;

		self.compressor = options.compressors.iter()
			.copied()
			.find(|c| reply.compression.contains(c) && SUPPORTED_COMPRESSORS.contains(c));

		if let Some(size) = reply.max_message_size_bytes.filter(|s| *s > 0) {
			self.max_message_size = size as usize;
		}

		trace!(connection = self.id, compressor = ?self.compressor, "handshake complete");
		Ok(reply)
	}

	fn next_request_id(&mut self) -> i32 {
		let id = self.next_request_id;
		self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
		id
	}

	/// Writes a request and returns the slot its reply will be delivered to.
	pub async fn send(&mut self, mut msg: Message) -> Result<oneshot::Receiver<Result<Message>>> {
		msg.request_id = self.next_request_id();
		let compressor = self.compressor.filter(|_| msg.compressible());
		let buf = msg.encode(compressor)?;

		if buf.len() > self.max_message_size {
			return Err(ProtocolError::MessageLength(buf.len() as i64).into());
		}

		let (tx, rx) = oneshot::channel();
		{
			let mut pending = self.pending.lock()?;
			if let Some(e) = &pending.closed {
				self.broken = true;
				return Err(e.clone());
			}
			pending.slots.insert(msg.request_id, tx);
		}

		trace!(connection = self.id, request = msg.request_id, command = msg.command_name(), "sending request");

		let write = async {
			self.writer.write_all(&buf).await?;
			self.writer.flush().await
		}.await;

		if let Err(e) = write {
			self.broken = true;
			self.pending.lock()?.slots.remove(&msg.request_id);
			return Err(e.into());
		}

		Ok(rx)
	}

	/// Sends one request and waits for its reply.
	pub async fn request(&mut self, msg: Message) -> Result<Message> {
		let rx = self.send(msg).await?;
		let result = rx.await.unwrap_or(Err(Error::ConnectionClosed));
		if result.is_err() {
			self.broken = true;
		}
		result
	}

	/// Runs a command against `db` and checks the reply for errors.
	pub async fn run_command(&mut self, db: &str, mut command: Document) -> Result<Document> {
		command.insert("$db", db);
		check_reply(self.request(Message::new(command)).await?.body)
	}

	/// True if the connection must not be reused.
	pub fn is_broken(&self) -> bool {
		self.broken || self.pending.lock().map(|p| p.closed.is_some()).unwrap_or(true)
	}

	pub(crate) fn mark_broken(&mut self) {
		self.broken = true;
	}

	pub fn idle_for(&self) -> Duration {
		self.last_used.elapsed()
	}

	/// Stops the receive loop and fails every outstanding request with `ConnectionClosed`.
	pub fn close(mut self) {
		self.shutdown();
	}

	fn shutdown(&mut self) {
		self.receiver.abort();
		self.broken = true;
		if let Ok(mut pending) = self.pending.lock() {
			pending.fail_all(Error::ConnectionClosed);
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.shutdown();
		debug!(connection = self.id, address = %self.address, "connection closed");
	}
}

async fn receive_loop<R: AsyncRead + Unpin>(
	id:      u64,
	address: ServerAddress,
	mut reader: R,
	pending: Arc<Mutex<Pending>>
) {
	let error = loop {
		let msg = match read_message(&mut reader, DEFAULT_MAX_MESSAGE_SIZE).await {
			Ok(msg) => msg,
			Err(e) => break e
		};

		let slot = match pending.lock() {
			Ok(mut pending) => pending.slots.remove(&msg.response_to),
			Err(_) => break Error::Sync
		};

		match slot {
			// the requester may have gone away, the reply is dropped then
			Some(slot) => { let _ = slot.send(Ok(msg)); }
			None => {
				error!(connection = id, %address, response_to = msg.response_to, "reply to unknown request, closing connection");
				break ProtocolError::ResponseTo(msg.response_to).into();
			}
		}
	};

	debug!(connection = id, %address, %error, "receive loop stopped");
	if let Ok(mut pending) = pending.lock() {
		pending.fail_all(error);
	}
}

#[cfg(feature = "tls")]
mod tls {
	use {
		crate::{*, common::TlsOptions},
		std::{fs::File, io::BufReader, sync::Arc},
		async_tls::TlsConnector,
		tracing::warn
	};

	pub fn connector(options: &TlsOptions) -> Result<TlsConnector> {
		if options.allow_invalid_hostnames {
			warn!("tlsAllowInvalidHostnames is not supported, host names are verified");
		}

		let ca_file = match &options.ca_file {
			None       => return Ok(TlsConnector::default()),
			Some(path) => path
		};

		let mut config = rustls::ClientConfig::new();
		config.root_store.add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);
		config.root_store.add_pem_file(&mut BufReader::new(File::open(ca_file)?))
			.map_err(|_| Error::invalid_options(format!("failed to read certificates from `{}`", ca_file)))?;
		Ok(TlsConnector::from(Arc::new(config)))
	}
}
