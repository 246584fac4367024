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

//! Command and connection pool monitoring.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/command-logging-and-monitoring/command-logging-and-monitoring.rst

use {
	crate::{Error, common::ServerAddress},
	std::{sync::{RwLock, atomic::{AtomicBool, Ordering}}, time::Duration},
	bson::Document
};

pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug)]
pub enum Event<'a> {
	CommandStarted {
		address:       &'a ServerAddress,
		command:       &'a Document,
		database_name: &'a str,
		command_name:  Command,
		operation_id:  u64,
		connection_id: u64
	},
	CommandSucceeded {
		address:       &'a ServerAddress,
		duration:      Duration,
		reply:         &'a Document,
		command_name:  Command,
		operation_id:  u64,
		connection_id: u64
	},
	CommandFailed {
		address:       &'a ServerAddress,
		duration:      Duration,
		failure:       &'a Error,
		command_name:  Command,
		operation_id:  u64,
		connection_id: u64
	},
	PoolCreated {
		address:       &'a ServerAddress,
		max_pool_size: usize
	},
	PoolCleared {
		address:       &'a ServerAddress,
		generation:    u32
	},
	PoolClosed {
		address:       &'a ServerAddress
	},
	ConnectionCreated {
		address:       &'a ServerAddress,
		connection_id: u64
	},
	ConnectionReady {
		address:       &'a ServerAddress,
		connection_id: u64
	},
	ConnectionClosed {
		address:       &'a ServerAddress,
		connection_id: u64,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		address:       &'a ServerAddress
	},
	ConnectionCheckOutFailed {
		address:       &'a ServerAddress,
		reason:        ConnectionCheckOutFailedReason
	},
	ConnectionCheckedOut {
		address:       &'a ServerAddress,
		connection_id: u64
	},
	ConnectionCheckedIn {
		address:       &'a ServerAddress,
		connection_id: u64
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
	Aggregate,
	BuildInfo,
	Count,
	Create,
	CreateIndexes,
	Delete,
	Distinct,
	Drop,
	DropDatabase,
	DropIndexes,
	Find,
	FindAndModify,
	GetMore,
	Hello,
	Insert,
	KillCursors,
	ListCollections,
	ListDatabases,
	ListIndexes,
	Ping,
	SaslContinue,
	SaslStart,
	Update,
	Unknown
}

impl From<&str> for Command {
	fn from(s: &str) -> Self {
		use self::Command::*;
		match s {
			"aggregate"       => Aggregate,
			"buildInfo"
			| "buildinfo"     => BuildInfo,
			"count"           => Count,
			"create"          => Create,
			"createIndexes"   => CreateIndexes,
			"delete"          => Delete,
			"distinct"        => Distinct,
			"drop"            => Drop,
			"dropDatabase"    => DropDatabase,
			"dropIndexes"     => DropIndexes,
			"find"            => Find,
			"findAndModify"   => FindAndModify,
			"getMore"         => GetMore,
			"hello"
			| "isMaster"
			| "ismaster"      => Hello,
			"insert"          => Insert,
			"killCursors"     => KillCursors,
			"listCollections" => ListCollections,
			"listDatabases"   => ListDatabases,
			"listIndexes"     => ListIndexes,
			"ping"            => Ping,
			"saslContinue"    => SaslContinue,
			"saslStart"       => SaslStart,
			"update"          => Update,
			_                 => Unknown
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	Error
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	Stale,
	Idle,
	Error,
	PoolClosed
}

/// Dispatches events to the registered listeners.
#[derive(Default)]
pub struct Monitor {
	enabled:   AtomicBool,
	listeners: RwLock<Vec<EventListener>>
}

impl std::fmt::Debug for Monitor {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Monitor")
			.field("enabled", &self.enabled)
			.finish()
	}
}

impl Monitor {
	pub fn add_listener(&self, listener: EventListener) {
		if let Ok(mut listeners) = self.listeners.write() {
			listeners.push(listener);
			self.enabled.store(true, Ordering::Release);
		}
	}

	/// Cheap check so callers can skip building events nobody listens to.
	pub fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::Acquire)
	}

	pub fn emit(&self, event: Event) {
		if !self.is_enabled() {
			return;
		}

		if let Ok(listeners) = self.listeners.read() {
			listeners.iter().for_each(|listener| listener(&event));
		}
	}
}
