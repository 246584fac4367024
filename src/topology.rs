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

//! Server discovery and primary tracking.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst

use {
	crate::{
		*,
		apm::Monitor,
		common::{ConnectOptions, Credential, ReadPreference, ReadPreferenceMode, ServerAddress},
		connection::Connection,
		pool::{Pool, PooledConnection},
		wire::{self, HandshakeReply, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_BSON_SIZE, DEFAULT_MAX_MESSAGE_SIZE}
	},
	std::{
		io,
		sync::{Arc, RwLock, Mutex, atomic::{AtomicUsize, Ordering}},
		time::{Duration, Instant}
	},
	async_std::task,
	bson::oid::ObjectId,
	futures::future::join_all,
	rand::seq::SliceRandom,
	tracing::{debug, info, warn}
};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ServerType {
	Standalone,
	Mongos,
	RSPrimary,
	RSSecondary,
	RSArbiter,
	RSOther,
	RSGhost,
	#[default]
	Unknown
}

impl ServerType {
	/// Standalone servers and routers accept writes just like a replica set primary.
	pub fn is_writable(self) -> bool {
		matches!(self, Self::Standalone | Self::Mongos | Self::RSPrimary)
	}
}

/// What the last probe learned about a node.
#[derive(Debug, Clone, Default)]
pub struct NodeDescription {
	pub r#type:               ServerType,
	pub rtt:                  Duration,
	pub last_update_time:     Option<Instant>,
	pub min_wire_version:     i32,
	pub max_wire_version:     i32,
	pub max_bson_object_size: usize,
	pub max_message_size:     usize,
	pub max_write_batch_size: usize,
	pub me:                   Option<String>,
	pub hosts:                Vec<String>,
	pub passives:             Vec<String>,
	pub arbiters:             Vec<String>,
	pub set_name:             Option<String>,
	pub set_version:          Option<i32>,
	pub election_id:          Option<ObjectId>,
	pub primary:              Option<String>,
	pub error:                Option<Error>
}

impl NodeDescription {
	fn unknown(error: Option<Error>) -> Self {
		Self {
			max_bson_object_size: DEFAULT_MAX_BSON_SIZE,
			max_message_size:     DEFAULT_MAX_MESSAGE_SIZE,
			max_write_batch_size: DEFAULT_MAX_BATCH_SIZE,
			last_update_time:     Some(Instant::now()),
			error,
			..Self::default()
		}
	}

	fn from_reply(reply: HandshakeReply, rtt: Duration) -> Self {
		let r#type = match &reply {
			HandshakeReply { msg: Some(msg), .. } if msg == "isdbgrid"        => ServerType::Mongos,
			HandshakeReply { set_name: Some(_), .. } if reply.is_writable_primary() => ServerType::RSPrimary,
			HandshakeReply { set_name: Some(_), hidden:       true, .. }      => ServerType::RSOther,
			HandshakeReply { set_name: Some(_), secondary:    true, .. }      => ServerType::RSSecondary,
			HandshakeReply { set_name: Some(_), arbiter_only: true, .. }      => ServerType::RSArbiter,
			HandshakeReply { set_name: Some(_), .. }                          => ServerType::RSOther,
			HandshakeReply { isreplicaset: true, .. }                         => ServerType::RSGhost,
			_                                                                 => ServerType::Standalone
		};

		let size = |v: Option<i64>, default: usize| v.filter(|v| *v > 0).map_or(default, |v| v as usize);

		Self {
			r#type,
			rtt,
			last_update_time:     Some(Instant::now()),
			min_wire_version:     reply.min_wire_version,
			max_wire_version:     reply.max_wire_version,
			max_bson_object_size: size(reply.max_bson_object_size, DEFAULT_MAX_BSON_SIZE),
			max_message_size:     size(reply.max_message_size_bytes, DEFAULT_MAX_MESSAGE_SIZE),
			max_write_batch_size: size(reply.max_write_batch_size, DEFAULT_MAX_BATCH_SIZE),
			me:                   reply.me,
			hosts:                reply.hosts,
			passives:             reply.passives,
			arbiters:             reply.arbiters,
			set_name:             reply.set_name,
			set_version:          reply.set_version,
			election_id:          reply.election_id,
			primary:              reply.primary,
			error:                None
		}
	}

	pub fn is_compatible(&self) -> bool {
		self.r#type == ServerType::Unknown || (self.min_wire_version <= wire::MAX_WIRE_VERSION
			&& self.max_wire_version >= wire::MIN_WIRE_VERSION)
	}

	fn members(&self) -> impl Iterator<Item = &String> {
		self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
	}
}

const SELECTION_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// One server: its address, its connection pool and what the last probe learned about it.
#[derive(Debug)]
pub struct Node {
	pub address:  ServerAddress,
	pub pool:     Pool,
	description:  RwLock<NodeDescription>,
	/// Unpooled and unauthenticated, used for probes only.
	monitor_conn: async_std::sync::Mutex<Option<Connection>>,
	options:      Arc<ConnectOptions>
}

impl Node {
	pub fn new(address: ServerAddress, options: Arc<ConnectOptions>, monitor: Arc<Monitor>) -> Self {
		Self {
			pool:         Pool::new(address.clone(), options.clone(), monitor),
			address,
			description:  RwLock::new(NodeDescription::unknown(None)),
			monitor_conn: async_std::sync::Mutex::new(None),
			options
		}
	}

	pub fn description(&self) -> NodeDescription {
		self.description.read().map(|d| d.clone()).unwrap_or_default()
	}

	pub fn server_type(&self) -> ServerType {
		self.description.read().map(|d| d.r#type).unwrap_or_default()
	}

	pub async fn acquire(&self) -> Result<PooledConnection> {
		self.pool.acquire().await
	}

	/// Runs the handshake on the monitoring connection and updates the cached description.
	/// A failed probe marks the node unknown and clears its pool.
	pub async fn probe(&self) -> Result<NodeDescription> {
		let start = Instant::now();
		let result = async_std::future::timeout(self.options.connect_timeout, self.handshake())
			.await
			.unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out").into()));

		let description = match result {
			Ok(reply) => NodeDescription::from_reply(reply, start.elapsed()),
			Err(e) => {
				debug!(address = %self.address, error = %e, "probe failed");
				self.set_description(NodeDescription::unknown(Some(e.clone())))?;
				self.pool.clear();
				return Err(e);
			}
		};

		debug!(address = %self.address, r#type = ?description.r#type, rtt = ?description.rtt, "probed node");
		self.set_description(description.clone())?;
		Ok(description)
	}

	async fn handshake(&self) -> Result<HandshakeReply> {
		let mut conn = self.monitor_conn.lock().await;
		if conn.as_ref().map_or(true, Connection::is_broken) {
			*conn = Some(Connection::open(&self.address, &self.options).await?);
		}

		match conn.as_mut() {
			Some(c) => {
				let result = c.handshake(&self.options).await;
				if result.is_err() {
					*conn = None;
				}
				result
			}
			None => Err(Error::ConnectionClosed)
		}
	}

	fn set_description(&self, description: NodeDescription) -> Result<()> {
		*self.description.write()? = description;
		Ok(())
	}

	fn demote(&self) -> Result<()> {
		self.description.write()?.r#type = ServerType::Unknown;
		self.pool.clear();
		Ok(())
	}

	pub async fn close(&self) {
		self.pool.close();
		*self.monitor_conn.lock().await = None;
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClusterState {
	Disconnected,
	Connecting,
	TopologyKnown,
	Ready,
	Closed
}

/// All nodes of one deployment plus the currently known primary.
#[derive(Debug, Clone)]
pub struct Cluster(Arc<ClusterInner>);

#[derive(Debug)]
pub struct ClusterInner {
	pub options:   Arc<ConnectOptions>,
	monitor:       Arc<Monitor>,
	state:         RwLock<ClusterState>,
	nodes:         RwLock<Vec<Arc<Node>>>,
	primary:       RwLock<Option<Arc<Node>>>,
	credential:    RwLock<Option<Credential>>,
	/// Highest (setVersion, electionId) seen from a primary, older claims are stale.
	max_election:  Mutex<Option<(Option<i32>, Option<ObjectId>)>>,
	topology_lock: async_std::sync::Mutex<()>,
	refreshes:     AtomicUsize
}

impl std::ops::Deref for Cluster {
	type Target = ClusterInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Cluster {
	pub fn new(options: ConnectOptions, monitor: Arc<Monitor>) -> Self {
		let options = Arc::new(options);
		let mut addresses = Vec::<ServerAddress>::with_capacity(options.servers.len());
		for address in &options.servers {
			if !addresses.contains(address) {
				addresses.push(address.clone());
			}
		}

		let nodes = addresses.into_iter()
			.map(|address| Arc::new(Node::new(address, options.clone(), monitor.clone())))
			.collect();

		Self(Arc::new(ClusterInner {
			credential:    RwLock::new(options.credential.clone()),
			options,
			monitor,
			state:         RwLock::new(ClusterState::Disconnected),
			nodes:         RwLock::new(nodes),
			primary:       RwLock::new(None),
			max_election:  Mutex::new(None),
			topology_lock: async_std::sync::Mutex::new(()),
			refreshes:     AtomicUsize::new(0)
		}))
	}

	pub fn state(&self) -> ClusterState {
		self.state.read().map(|s| *s).unwrap_or(ClusterState::Closed)
	}

	fn set_state(&self, state: ClusterState) -> Result<()> {
		*self.state.write()? = state;
		Ok(())
	}

	pub fn nodes(&self) -> Vec<Arc<Node>> {
		self.nodes.read().map(|n| n.clone()).unwrap_or_default()
	}

	pub fn primary(&self) -> Option<Arc<Node>> {
		self.primary.read().ok().and_then(|p| p.clone())
	}

	/// Number of topology refreshes so far, including the initial one.
	pub fn refresh_count(&self) -> usize {
		self.refreshes.load(Ordering::Acquire)
	}

	fn check_open(&self) -> Result<()> {
		match self.state() {
			ClusterState::Closed => Err(Error::ClusterClosed),
			_ => Ok(())
		}
	}

	/// Probes every configured address concurrently. Succeeds if at least one node answered.
	pub async fn connect(&self) -> Result<()> {
		match self.state() {
			ClusterState::Closed => return Err(Error::ClusterClosed),
			ClusterState::Disconnected => self.set_state(ClusterState::Connecting)?,
			_ => return Err(Error::IllegalState("the cluster is already connected"))
		}

		if let Err(e) = self.update_master().await {
			self.set_state(ClusterState::Disconnected)?;
			return Err(e);
		}

		let nodes = self.nodes();
		if let Some(node) = nodes.iter().find(|n| n.server_type() != ServerType::Unknown && !n.description().is_compatible()) {
			if !nodes.iter().any(|n| n.server_type() != ServerType::Unknown && n.description().is_compatible()) {
				let description = node.description();
				self.set_state(ClusterState::Disconnected)?;
				return Err(Error::IncompatibleServer {
					address: node.address.clone(),
					min:     description.min_wire_version,
					max:     description.max_wire_version
				});
			}
		}

		self.set_state(ClusterState::TopologyKnown)?;

		let credential = self.credential.read()?.clone();
		if let Some(credential) = credential {
			self.authenticate(credential)?;
		}

		self.set_state(ClusterState::Ready)?;
		info!(nodes = nodes.len(), primary = ?self.primary().map(|n| n.address.to_string()), "cluster ready");

		if self.options.pool.min_pool_size > 0 {
			for node in nodes {
				task::spawn(async move { node.pool.fill().await });
			}
		}

		Ok(())
	}

	/// Installs `credential` on every node; each pooled connection authenticates when it is opened.
	/// Existing connections are dropped, they were authenticated differently.
	pub fn authenticate(&self, credential: Credential) -> Result<()> {
		self.check_open()?;
		for node in self.nodes() {
			if node.pool.set_credential(Some(credential.clone())).is_ok() {
				node.pool.clear();
			}
		}
		*self.credential.write()? = Some(credential);
		Ok(())
	}

	/// Re-probes all nodes, discovers advertised members and re-elects the primary pointer.
	pub async fn update_master(&self) -> Result<()> {
		let _guard = self.topology_lock.lock().await;
		self.check_open()?;
		self.refreshes.fetch_add(1, Ordering::AcqRel);

		let mut probed = Vec::<ServerAddress>::new();
		let mut errors = Vec::new();

		// newly discovered members are probed in the next round
		loop {
			let pending = self.nodes().into_iter()
				.filter(|n| !probed.contains(&n.address))
				.collect::<Vec<_>>();

			if pending.is_empty() {
				break;
			}

			let results = join_all(pending.iter().map(|node| node.probe())).await;
			for (node, result) in pending.iter().zip(results) {
				probed.push(node.address.clone());
				match result {
					Ok(description) => self.discover(&description)?,
					Err(e) => errors.push(format!("{}: {}", node.address, e))
				}
			}
		}

		if self.nodes().iter().all(|n| n.server_type() == ServerType::Unknown) {
			*self.primary.write()? = None;
			return Err(Error::ClusterUnreachable(errors.join(", ")));
		}

		self.elect_primary()
	}

	fn discover(&self, description: &NodeDescription) -> Result<()> {
		if !matches!(description.r#type, ServerType::RSPrimary | ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther) {
			return Ok(());
		}

		if self.options.replica_set.is_some() && self.options.replica_set != description.set_name {
			return Ok(());
		}

		let mut nodes = self.nodes.write()?;
		for member in description.members() {
			let address = match member.parse::<ServerAddress>() {
				Ok(address) => address,
				Err(e) => {
					warn!(member = %member, error = %e, "ignoring invalid member address");
					continue;
				}
			};

			if !nodes.iter().any(|n| n.address == address) {
				info!(%address, "discovered new member");
				let node = Node::new(address, self.options.clone(), self.monitor.clone());
				if let Ok(credential) = self.credential.read() {
					let _ = node.pool.set_credential(credential.clone());
				}
				nodes.push(Arc::new(node));
			}
		}
		Ok(())
	}

	/// Picks at most one writable node. Among competing replica set primaries the highest
	/// (setVersion, electionId) wins, the others are demoted.
	fn elect_primary(&self) -> Result<()> {
		let nodes = self.nodes();
		let candidates = nodes.iter()
			.filter(|n| {
				let d = n.description();
				d.r#type.is_writable() && d.is_compatible() && (d.r#type != ServerType::RSPrimary
					|| self.options.replica_set.is_none() || self.options.replica_set == d.set_name)
			})
			.cloned()
			.collect::<Vec<_>>();

		let election = |n: &Arc<Node>| {
			let d = n.description();
			(d.set_version, d.election_id)
		};

		let mut max_election = self.max_election.lock()?;
		let primary = match candidates.iter().filter(|n| n.server_type() == ServerType::RSPrimary).max_by_key(|n| election(n)) {
			Some(primary) => {
				let claim = election(primary);
				if max_election.map_or(false, |max| claim < max) {
					warn!(address = %primary.address, "ignoring stale primary");
					primary.demote()?;
					None
				} else {
					*max_election = Some(claim);
					Some(primary.clone())
				}
			}
			None => candidates.iter().min_by_key(|n| n.description().rtt).cloned()
		};
		drop(max_election);

		for node in &candidates {
			if node.server_type() == ServerType::RSPrimary && primary.as_ref().map_or(true, |p| p.address != node.address) {
				warn!(address = %node.address, "demoting outdated primary");
				node.demote()?;
			}
		}

		let mut current = self.primary.write()?;
		let changed = current.as_ref().map(|n| &n.address) != primary.as_ref().map(|n| &n.address);
		if changed {
			info!(primary = ?primary.as_ref().map(|n| n.address.to_string()), "primary changed");
		}
		*current = primary;
		Ok(())
	}

	/// Selects a node for `read_preference`. Writes always pass `ReadPreference::PRIMARY`.
	pub fn select_node(&self, read_preference: &ReadPreference) -> Result<Arc<Node>> {
		match self.state() {
			ClusterState::Closed => return Err(Error::ClusterClosed),
			ClusterState::Disconnected | ClusterState::Connecting => return Err(Error::IllegalState("the cluster is not connected")),
			_ => ()
		}

		let primary = self.primary();

		// single servers and routers serve every read preference
		if let Some(primary) = primary.as_ref().filter(|p| p.server_type() != ServerType::RSPrimary) {
			return Ok(primary.clone());
		}

		let secondaries = self.nodes().into_iter()
			.filter(|n| n.server_type() == ServerType::RSSecondary && n.description().is_compatible())
			.collect::<Vec<_>>();
		let random_secondary = || secondaries.choose(&mut rand::thread_rng()).cloned();

		match read_preference.mode {
			ReadPreferenceMode::Primary            => primary.ok_or(Error::NoPrimary),
			ReadPreferenceMode::PrimaryPreferred   => primary.or_else(random_secondary).ok_or(Error::NoMatchingServer),
			ReadPreferenceMode::Secondary          => random_secondary().ok_or(Error::NoMatchingServer),
			ReadPreferenceMode::SecondaryPreferred => random_secondary().or(primary).ok_or(Error::NoMatchingServer),
			ReadPreferenceMode::Nearest            => primary.into_iter()
				.chain(secondaries.iter().cloned())
				.min_by_key(|n| n.description().rtt)
				.ok_or(Error::NoMatchingServer)
		}
	}

	/// Like `select_node`, but refreshes the topology until a node matches or the server selection timeout expires.
	pub async fn select_node_wait(&self, read_preference: &ReadPreference) -> Result<Arc<Node>> {
		let deadline = Instant::now() + self.options.server_selection_timeout;
		loop {
			let error = match self.select_node(read_preference) {
				Err(e @ (Error::NoPrimary | Error::NoMatchingServer)) => e,
				result => return result
			};

			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Err(error);
			}

			debug!(mode = read_preference.mode.as_str(), %error, "no suitable node, waiting for the topology to change");
			task::sleep(remaining.min(SELECTION_RETRY_INTERVAL)).await;
			match self.update_master().await {
				Err(Error::ClusterClosed) => return Err(Error::ClusterClosed),
				Err(e) => debug!(error = %e, "topology refresh failed"),
				Ok(()) => ()
			}
		}
	}

	/// Closes every pool. Later operations fail with `ClusterClosed`.
	pub async fn close(&self) -> Result<()> {
		let _guard = self.topology_lock.lock().await;
		if self.state() == ClusterState::Closed {
			return Ok(());
		}

		self.set_state(ClusterState::Closed)?;
		*self.primary.write()? = None;
		for node in self.nodes() {
			node.close().await;
		}
		info!("cluster closed");
		Ok(())
	}
}
