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
		common::{ReadPreference, WriteConcern},
		cursor::{Cursor, CursorKind},
		protocol::WireProtocol
	},
	std::{collections::HashMap, sync::{Arc, Mutex}},
	bson::{doc, Document},
	tracing::debug
};

/// A handle to one database. Cheap to clone, collections obtained from it are cached.
#[derive(Debug, Clone)]
pub struct Database(pub(crate) Arc<DatabaseInner>);

#[derive(Debug)]
pub struct DatabaseInner {
	pub name:            String,
	pub read_preference: ReadPreference,
	pub write_concern:   Option<WriteConcern>,
	protocol:            WireProtocol,
	collections:         Mutex<HashMap<String, Collection>>
}

impl std::ops::Deref for Database {
	type Target = DatabaseInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Database {
	pub(crate) fn new(
		protocol:        WireProtocol,
		name:            &str,
		read_preference: ReadPreference,
		write_concern:   Option<WriteConcern>
	) -> Self {
		Self(Arc::new(DatabaseInner {
			name:        name.to_string(),
			read_preference,
			write_concern,
			protocol,
			collections: Mutex::new(HashMap::new())
		}))
	}

	/// Returns the handle for `name`, the same one on every call.
	pub fn collection(&self, name: &str) -> Collection {
		let new = || Collection::new(self.protocol.clone(), &self.name, name, self.read_preference, self.write_concern);
		match self.collections.lock() {
			Ok(mut cache) => cache.entry(name.to_string()).or_insert_with(new).clone(),
			Err(_) => new()
		}
	}

	/// Runs an arbitrary command against this database on the primary.
	pub async fn run_command(&self, command: Document) -> Result<Document> {
		self.protocol.command_single(&self.name, command).await
	}

	pub async fn run_command_with(&self, command: Document, read_preference: &ReadPreference) -> Result<Document> {
		self.protocol.command_single_with(&self.name, command, read_preference).await
	}

	/// Runs a pipeline that does not need a collection, such as `$currentOp`.
	pub fn aggregate(&self, pipeline: Vec<Document>) -> Cursor {
		Cursor::new(
			self.protocol.clone(),
			&self.name,
			doc! { "aggregate": 1, "pipeline": pipeline },
			CursorKind::Aggregate,
			self.read_preference
		)
	}

	pub fn list_collections(&self, filter: Option<Document>) -> Cursor {
		let mut command = doc! { "listCollections": 1 };
		if let Some(filter) = filter {
			command.insert("filter", filter);
		}
		Cursor::new(self.protocol.clone(), &self.name, command, CursorKind::ListCollections, self.read_preference)
	}

	pub async fn list_collection_names(&self) -> Result<Vec<String>> {
		let mut cursor = self.list_collections(None);
		let mut names = Vec::new();
		while let Some(info) = cursor.next().await? {
			if let Ok(name) = info.get_str("name") {
				names.push(name.to_string());
			}
		}
		Ok(names)
	}

	/// Drops the database and forgets every cached collection handle.
	pub async fn drop(&self) -> Result<()> {
		let mut command = doc! { "dropDatabase": 1 };
		if let Some(write_concern) = &self.write_concern {
			command.insert("writeConcern", bson::to_document(write_concern)?);
		}
		self.run_command(command).await?;
		self.collections.lock()?.clear();
		debug!(db = %self.name, "database dropped");
		Ok(())
	}
}
