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
		protocol::WireProtocol,
		wire::{Message, DEFAULT_MAX_BATCH_SIZE}
	},
	std::sync::{Arc, atomic::{AtomicBool, Ordering}},
	bson::{doc, oid::ObjectId, Bson, Document},
	serde::{Serialize, Deserialize},
	tracing::debug
};

/// NamespaceNotFound, returned by older servers when dropping something that does not exist.
const NAMESPACE_NOT_FOUND: i32 = 26;

/// A handle to one collection. Cheap to clone, all clones share the index sync flag.
#[derive(Debug, Clone)]
pub struct Collection(pub(crate) Arc<CollectionInner>);

#[derive(Debug)]
pub struct CollectionInner {
	pub db:              String,
	pub name:            String,
	pub read_preference: ReadPreference,
	pub write_concern:   Option<WriteConcern>,
	protocol:            WireProtocol,
	indexes_synced:      AtomicBool
}

impl std::ops::Deref for Collection {
	type Target = CollectionInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Collection {
	pub(crate) fn new(
		protocol:        WireProtocol,
		db:              &str,
		name:            &str,
		read_preference: ReadPreference,
		write_concern:   Option<WriteConcern>
	) -> Self {
		Self(Arc::new(CollectionInner {
			db:             db.to_string(),
			name:           name.to_string(),
			read_preference,
			write_concern,
			protocol,
			indexes_synced: AtomicBool::new(false)
		}))
	}

	/// `db.name`
	pub fn namespace(&self) -> String {
		format!("{}.{}", self.db, self.name)
	}

	fn cursor(&self, command: Document, kind: CursorKind) -> Cursor {
		Cursor::new(self.protocol.clone(), &self.db, command, kind, self.read_preference)
	}

	async fn write(&self, command: &impl Serialize) -> Result<WriteReply> {
		let reply = self.protocol.command_single(&self.db, bson::to_document(command)?).await?;
		Ok(bson::from_document(reply)?)
	}

	async fn read(&self, command: &impl Serialize) -> Result<Document> {
		self.protocol.command_single_with(&self.db, bson::to_document(command)?, &self.read_preference).await
	}

	fn max_write_batch_size(&self) -> usize {
		self.protocol.cluster().primary()
			.map_or(DEFAULT_MAX_BATCH_SIZE, |node| node.description().max_write_batch_size)
			.max(1)
	}

	/// Runs an aggregation pipeline. Skip, limit and sort set on the cursor are appended as stages.
	///
	/// see https://docs.mongodb.com/manual/reference/command/aggregate/
	pub fn aggregate(&self, pipeline: Vec<Document>, options: Option<AggregateOptions>) -> Result<Cursor> {
		let options = options.unwrap_or_default();
		let mut command = doc! { "aggregate": self.name.as_str(), "pipeline": pipeline };
		if let Some(allow_disk_use) = options.allow_disk_use {
			command.insert("allowDiskUse", allow_disk_use);
		}

		let mut cursor = self.cursor(command, CursorKind::Aggregate);
		if let Some(batch_size) = options.batch_size {
			cursor.batch_size(batch_size)?;
		}
		Ok(cursor)
	}

	/// Counts with the `count` command, which may be inaccurate on sharded clusters.
	pub async fn count(&self, filter: Option<Document>) -> Result<u64> {
		let reply = self.read(&CountCommand { count: &self.name, query: filter }).await?;
		Ok(wire::get_int(&reply, "n").unwrap_or_default() as u64)
	}

	/// Counts the documents matching `filter` with an aggregation, which is accurate everywhere.
	pub async fn count_documents(&self, filter: Option<Document>, options: Option<CountOptions>) -> Result<u64> {
		let options = options.unwrap_or_default();
		let mut pipeline = vec![doc! { "$match": filter.unwrap_or_default() }];
		if let Some(skip) = options.skip {
			pipeline.push(doc! { "$skip": skip as i64 });
		}
		if let Some(limit) = options.limit {
			pipeline.push(doc! { "$limit": limit });
		}
		pipeline.push(doc! { "$group": { "_id": 1, "n": { "$sum": 1 } } });

		self.aggregate_count(pipeline).await
	}

	/// Reads the document count from collection metadata.
	pub async fn estimated_document_count(&self) -> Result<u64> {
		self.aggregate_count(vec![
			doc! { "$collStats": { "count": {} } },
			doc! { "$group": { "_id": 1, "n": { "$sum": "$count" } } }
		]).await
	}

	async fn aggregate_count(&self, pipeline: Vec<Document>) -> Result<u64> {
		let mut cursor = self.aggregate(pipeline, None)?;
		let count = cursor.next().await?
			.and_then(|doc| wire::get_int(&doc, "n"))
			.unwrap_or_default();
		cursor.close().await;
		Ok(count as u64)
	}

	/// Finds the distinct values of `key` across the documents matching `filter`.
	pub async fn distinct(&self, key: &str, filter: Option<Document>) -> Result<Vec<Bson>> {
		let reply = self.read(&DistinctCommand { distinct: &self.name, key, query: filter }).await?;
		Ok(bson::from_document::<DistinctReply>(reply)?.values)
	}

	/// Returns a lazy cursor, nothing is sent before the first `next()`.
	///
	/// see https://docs.mongodb.com/manual/reference/command/find/
	pub fn find(&self, filter: Option<Document>, options: Option<FindOptions>) -> Result<Cursor> {
		let options = options.unwrap_or_default();
		let mut command = doc! { "find": self.name.as_str(), "filter": filter.unwrap_or_default() };
		if let Some(projection) = options.projection {
			command.insert("projection", projection);
		}

		let mut cursor = self.cursor(command, CursorKind::Find);
		if let Some(sort) = options.sort {
			cursor.sort(sort)?;
		}
		if let Some(skip) = options.skip {
			cursor.skip(skip)?;
		}
		if let Some(limit) = options.limit {
			cursor.limit(limit)?;
		}
		if let Some(batch_size) = options.batch_size {
			cursor.batch_size(batch_size)?;
		}
		Ok(cursor)
	}

	pub async fn find_one(&self, filter: Option<Document>, options: Option<FindOptions>) -> Result<Option<Document>> {
		let options = FindOptions { limit: Some(1), batch_size: Some(1), ..options.unwrap_or_default() };
		let mut cursor = self.find(filter, Some(options))?;
		let doc = cursor.next().await?;
		cursor.close().await;
		Ok(doc)
	}

	/// Looks a document up by `_id`. Strings holding 24 hex digits are matched as object ids.
	pub async fn find_by_id(&self, id: impl Into<Bson>) -> Result<Option<Document>> {
		self.find_one(Some(id_filter(id.into())), None).await
	}

	/// Inserts one document, generating an `_id` if it has none.
	pub async fn insert_one(&self, document: Document) -> Result<InsertOneResult> {
		let mut result = self.insert_many(vec![document], None).await?;
		Ok(InsertOneResult { inserted_id: result.inserted_ids.pop().unwrap_or_default() })
	}

	/// Inserts `documents`, split into batches of the primary's `maxWriteBatchSize`.
	/// Each batch is sent as a `documents` sequence. Documents without `_id` get a fresh object id.
	///
	/// see https://docs.mongodb.com/manual/reference/command/insert/
	pub async fn insert_many(
		&self,
		documents: impl IntoIterator<Item = Document>,
		options:   Option<InsertManyOptions>
	) -> Result<InsertManyResult> {
		let documents = documents.into_iter().map(with_id).collect::<Vec<_>>();
		let inserted_ids = documents.iter()
			.filter_map(|doc| doc.get("_id"))
			.map(id_to_string)
			.collect::<Vec<_>>();

		if documents.is_empty() {
			return Ok(InsertManyResult { inserted_ids });
		}

		let command = bson::to_document(&InsertCommand {
			insert:        &self.name,
			ordered:       options.and_then(|o| o.ordered).unwrap_or(true),
			write_concern: self.write_concern
		})?;

		let mut inserted = 0;
		for batch in documents.chunks(self.max_write_batch_size()) {
			let msg = Message::new(command.clone()).with_sequence("documents", batch.to_vec());
			let (_, reply) = self.protocol.execute(&self.db, msg, &ReadPreference::PRIMARY).await?;
			inserted += wire::get_int(&reply, "n").unwrap_or_default();
		}

		debug!(ns = %self.namespace(), inserted, "documents inserted");
		Ok(InsertManyResult { inserted_ids })
	}

	/// Inserts one or many documents.
	pub async fn insert(&self, documents: impl IntoIterator<Item = Document>) -> Result<InsertManyResult> {
		self.insert_many(documents, None).await
	}

	pub async fn save(&self, documents: impl IntoIterator<Item = Document>) -> Result<InsertManyResult> {
		self.insert(documents).await
	}

	async fn update(&self, filter: Document, update: Document, multi: bool, options: Option<UpdateOptions>) -> Result<UpdateResult> {
		let reply = self.write(&UpdateCommand {
			update:        &self.name,
			updates:       vec![UpdateStatement {
				q:      filter,
				u:      update,
				multi,
				upsert: options.and_then(|o| o.upsert).unwrap_or(false)
			}],
			ordered:       true,
			write_concern: self.write_concern
		}).await?;

		let upserted_id = reply.upserted.into_iter().next().map(|u| u.id);
		Ok(UpdateResult {
			matched_count:  (reply.n as u64).saturating_sub(upserted_id.is_some() as u64),
			modified_count: reply.n_modified as u64,
			upserted_id
		})
	}

	/// Updates the first document matching `filter`. `update` is either an operator document or a replacement.
	///
	/// see https://docs.mongodb.com/manual/reference/command/update/
	pub async fn update_one(&self, filter: Document, update: Document, options: Option<UpdateOptions>) -> Result<UpdateResult> {
		self.update(filter, update, false, options).await
	}

	pub async fn update_many(&self, filter: Document, update: Document, options: Option<UpdateOptions>) -> Result<UpdateResult> {
		self.update(filter, update, true, options).await
	}

	async fn delete_matching(&self, filter: Document, limit: i32) -> Result<DeleteResult> {
		let reply = self.write(&DeleteCommand {
			delete:        &self.name,
			deletes:       vec![DeleteStatement { q: filter, limit }],
			ordered:       true,
			write_concern: self.write_concern
		}).await?;
		Ok(DeleteResult { deleted_count: reply.n as u64 })
	}

	/// see https://docs.mongodb.com/manual/reference/command/delete/
	pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
		self.delete_matching(filter, 1).await
	}

	pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
		self.delete_matching(filter, 0).await
	}

	pub async fn delete(&self, filter: Document) -> Result<DeleteResult> {
		self.delete_many(filter).await
	}

	pub async fn find_one_and_delete(&self, filter: Document) -> Result<DeleteResult> {
		self.delete_one(filter).await
	}

	pub async fn delete_by_id(&self, id: impl Into<Bson>) -> Result<DeleteResult> {
		self.delete_one(id_filter(id.into())).await
	}

	/// Atomically modifies and returns one document. Either `update` or `options.remove` is required.
	///
	/// see https://docs.mongodb.com/manual/reference/command/findAndModify/
	pub async fn find_and_modify(
		&self,
		query:   Document,
		update:  Option<Document>,
		options: Option<FindAndModifyOptions>
	) -> Result<Option<Document>> {
		let options = options.unwrap_or_default();
		let remove = options.remove.unwrap_or(false);
		if update.is_none() == !remove {
			return Err(Error::IllegalState("findAndModify needs exactly one of an update or remove"));
		}

		let reply = self.protocol.command_single(&self.db, bson::to_document(&FindAndModifyCommand {
			find_and_modify: &self.name,
			query,
			sort:            options.sort,
			remove,
			update,
			new:             options.new.unwrap_or(false),
			fields:          options.fields,
			upsert:          options.upsert.unwrap_or(false),
			write_concern:   self.write_concern
		})?).await?;

		Ok(bson::from_document::<FindAndModifyReply>(reply)?.value)
	}

	/// Updates the first matching document, returning it as it was before or after the update.
	pub async fn find_one_and_update(
		&self,
		filter:  Document,
		update:  Document,
		options: Option<FindOneAndUpdateOptions>
	) -> Result<Option<Document>> {
		let options = options.unwrap_or_default();
		self.find_and_modify(filter, Some(update), Some(FindAndModifyOptions {
			sort:   options.sort,
			fields: options.projection,
			new:    Some(options.return_document == ReturnDocument::After),
			upsert: options.upsert,
			remove: None
		})).await
	}

	/// Creates `indexes`, returning their names.
	///
	/// see https://docs.mongodb.com/manual/reference/command/createIndexes/
	pub async fn create_indexes(&self, indexes: Vec<IndexModel>) -> Result<Vec<String>> {
		let names = indexes.iter().map(IndexModel::name).collect::<Vec<_>>();
		self.write(&CreateIndexesCommand {
			create_indexes: &self.name,
			indexes:        indexes.into_iter().map(IndexModel::into_spec).collect(),
			write_concern:  self.write_concern
		}).await?;
		Ok(names)
	}

	pub async fn create_index(&self, index: IndexModel) -> Result<String> {
		let mut names = self.create_indexes(vec![index]).await?;
		Ok(names.pop().unwrap_or_default())
	}

	pub async fn drop_index(&self, name: &str) -> Result<()> {
		self.write(&DropIndexesCommand { drop_indexes: &self.name, index: name, write_concern: self.write_concern })
			.await
			.map(drop)
	}

	/// Drops every index but the one on `_id`.
	pub async fn drop_indexes(&self) -> Result<()> {
		self.drop_index("*").await
	}

	pub fn list_indexes(&self) -> Cursor {
		self.cursor(doc! { "listIndexes": self.name.as_str() }, CursorKind::ListIndexes)
	}

	/// Replaces all indexes with `indexes`. Only the first call on a handle talks to the server,
	/// later calls return the names right away.
	pub async fn sync_indexes(&self, indexes: Vec<IndexModel>) -> Result<Vec<String>> {
		if self.indexes_synced.load(Ordering::Acquire) {
			return Ok(indexes.iter().map(IndexModel::name).collect());
		}

		match self.drop_indexes().await {
			Err(e) if e.code() == Some(NAMESPACE_NOT_FOUND) => (),
			result => result?
		}

		let names = if indexes.is_empty() {
			Vec::new()
		} else {
			self.create_indexes(indexes).await?
		};

		self.indexes_synced.store(true, Ordering::Release);
		debug!(ns = %self.namespace(), ?names, "indexes synced");
		Ok(names)
	}

	/// Drops the collection. Dropping a collection that does not exist is not an error.
	pub async fn drop(&self) -> Result<()> {
		let result = self.write(&DropCommand { drop: &self.name, write_concern: self.write_concern }).await;
		self.indexes_synced.store(false, Ordering::Release);
		match result {
			Err(e) if e.code() == Some(NAMESPACE_NOT_FOUND) => Ok(()),
			result => result.map(drop)
		}
	}
}

fn with_id(doc: Document) -> Document {
	if doc.contains_key("_id") {
		return doc;
	}
	let mut with_id = doc! { "_id": ObjectId::new() };
	with_id.extend(doc);
	with_id
}

fn id_to_string(id: &Bson) -> String {
	match id {
		Bson::ObjectId(id) => id.to_hex(),
		Bson::String(id)   => id.clone(),
		id                 => id.to_string()
	}
}

fn id_filter(id: Bson) -> Document {
	match id {
		Bson::String(hex) => match ObjectId::parse_str(&hex) {
			Ok(id) => doc! { "_id": id },
			Err(_) => doc! { "_id": hex }
		},
		id => doc! { "_id": id }
	}
}

#[derive(Debug, Default, Clone)]
pub struct FindOptions {
	pub skip:       Option<u64>,
	pub limit:      Option<i64>,
	pub sort:       Option<Document>,
	pub projection: Option<Document>,
	pub batch_size: Option<u32>
}

#[derive(Debug, Default, Copy, Clone)]
pub struct AggregateOptions {
	pub batch_size:     Option<u32>,
	pub allow_disk_use: Option<bool>
}

#[derive(Debug, Default, Copy, Clone)]
pub struct CountOptions {
	pub skip:  Option<u64>,
	pub limit: Option<i64>
}

#[derive(Debug, Default, Copy, Clone)]
pub struct InsertManyOptions {
	/// Stop at the first failing document, defaults to true.
	pub ordered: Option<bool>
}

#[derive(Debug, Default, Copy, Clone)]
pub struct UpdateOptions {
	/// Insert a document if nothing matches.
	pub upsert: Option<bool>
}

#[derive(Debug, Default, Clone)]
pub struct FindAndModifyOptions {
	pub sort:   Option<Document>,
	pub fields: Option<Document>,
	/// Return the modified document instead of the original.
	pub new:    Option<bool>,
	pub upsert: Option<bool>,
	pub remove: Option<bool>
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ReturnDocument {
	/// The document as it was before the update.
	#[default]
	Before,
	/// The document as it is after the update.
	After
}

#[derive(Debug, Default, Clone)]
pub struct FindOneAndUpdateOptions {
	pub sort:            Option<Document>,
	pub projection:      Option<Document>,
	pub return_document: ReturnDocument,
	pub upsert:          Option<bool>
}

/// An index specification. The name is derived from the keys unless `options` contains one.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
	pub keys:    Document,
	pub options: Option<Document>
}

impl IndexModel {
	pub fn new(keys: Document) -> Self {
		Self { keys, options: None }
	}

	pub fn with_options(keys: Document, options: Document) -> Self {
		Self { keys, options: Some(options) }
	}

	/// `{ a: 1, b: -1 }` is named `a_1_b_-1`.
	pub fn name(&self) -> String {
		if let Some(name) = self.options.as_ref().and_then(|o| o.get_str("name").ok()) {
			return name.to_string();
		}

		self.keys.iter()
			.map(|(key, value)| match value {
				Bson::String(kind) => format!("{}_{}", key, kind),
				Bson::Int32(v)     => format!("{}_{}", key, v),
				Bson::Int64(v)     => format!("{}_{}", key, v),
				Bson::Double(v)    => format!("{}_{}", key, *v as i64),
				_                  => format!("{}_1", key)
			})
			.collect::<Vec<_>>()
			.join("_")
	}

	fn into_spec(self) -> Document {
		let name = self.name();
		let mut spec = doc! { "key": self.keys, "name": name };
		if let Some(options) = self.options {
			for (k, v) in options {
				spec.insert(k, v);
			}
		}
		spec
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InsertOneResult {
	/// The `_id` of the inserted document, object ids as hex strings.
	pub inserted_id: String
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InsertManyResult {
	pub inserted_ids: Vec<String>
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
	/// The number of documents that matched the filter.
	pub matched_count:  u64,
	/// The number of documents that were modified.
	pub modified_count: u64,
	/// The identifier of the inserted document if an upsert took place.
	pub upserted_id:    Option<Bson>
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeleteResult {
	pub deleted_count: u64
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertCommand<'a> {
	insert:        &'a str,
	ordered:       bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	write_concern: Option<WriteConcern>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCommand<'a> {
	update:        &'a str,
	updates:       Vec<UpdateStatement>,
	ordered:       bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	write_concern: Option<WriteConcern>
}

#[derive(Debug, Clone, Serialize)]
struct UpdateStatement {
	q:      Document,
	u:      Document,
	multi:  bool,
	upsert: bool
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteCommand<'a> {
	delete:        &'a str,
	deletes:       Vec<DeleteStatement>,
	ordered:       bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	write_concern: Option<WriteConcern>
}

#[derive(Debug, Clone, Serialize)]
struct DeleteStatement {
	q:     Document,
	/// 0 deletes every match, 1 only the first.
	limit: i32
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindAndModifyCommand<'a> {
	find_and_modify: &'a str,
	query:           Document,
	#[serde(skip_serializing_if = "Option::is_none")]
	sort:            Option<Document>,
	remove:          bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	update:          Option<Document>,
	new:             bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	fields:          Option<Document>,
	upsert:          bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	write_concern:   Option<WriteConcern>
}

#[derive(Debug, Clone, Serialize)]
struct CountCommand<'a> {
	count: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	query: Option<Document>
}

#[derive(Debug, Clone, Serialize)]
struct DistinctCommand<'a> {
	distinct: &'a str,
	key:      &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	query:    Option<Document>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateIndexesCommand<'a> {
	create_indexes: &'a str,
	indexes:        Vec<Document>,
	#[serde(skip_serializing_if = "Option::is_none")]
	write_concern:  Option<WriteConcern>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DropIndexesCommand<'a> {
	drop_indexes:  &'a str,
	index:         &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	write_concern: Option<WriteConcern>
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DropCommand<'a> {
	drop:          &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	write_concern: Option<WriteConcern>
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WriteReply {
	n:          i64,
	#[serde(rename = "nModified")]
	n_modified: i64,
	upserted:   Vec<Upserted>
}

#[derive(Debug, Deserialize)]
struct Upserted {
	#[serde(rename = "_id")]
	id: Bson
}

#[derive(Debug, Deserialize)]
struct FindAndModifyReply {
	#[serde(default)]
	value: Option<Document>
}

#[derive(Debug, Deserialize)]
struct DistinctReply {
	values: Vec<Bson>
}
