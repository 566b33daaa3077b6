//! LanceDB-backed [`VectorStore`].
//!
//! One table `vectors(chunk_id, provider_tag, vector)`; upserts go through
//! `merge_insert` on `chunk_id`. Candidates come from Lance's vector search and
//! are rescored locally so every metric reports the same numbers as the
//! in-memory store.
use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{connect, Connection, DistanceType, Table};
use std::fmt::Display;
use std::sync::Arc;
use tracing::debug;

use recall_core::error::{Error, Result};
use recall_core::traits::VectorStore;
use recall_core::types::{ChunkId, SimilarityMetric, VectorRecord};

use crate::similarity::similarity;

pub const VECTORS_TABLE: &str = "vectors";

fn storage<E: Display>(e: E) -> Error {
    Error::Storage(e.to_string())
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn build_vectors_schema(dim: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("provider_tag", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim),
            true,
        ),
    ]))
}

pub struct LanceVectorStore {
    conn: Connection,
    table_name: String,
    dim: i32,
}

impl LanceVectorStore {
    /// Open (or create) the vectors table under `uri`.
    pub async fn open(uri: &str, dim: usize) -> Result<Self> {
        let dim =
            i32::try_from(dim).map_err(|_| Error::config(format!("dimension {dim} too large")))?;
        let conn = connect(uri).execute().await.map_err(storage)?;
        let store = Self { conn, table_name: VECTORS_TABLE.to_string(), dim };
        store.ensure_table().await?;
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.conn.table_names().execute().await.map_err(storage)?;
        if names.contains(&self.table_name) {
            return Ok(());
        }
        let schema = build_vectors_schema(self.dim);
        let iter = RecordBatchIterator::new(vec![].into_iter(), schema);
        self.conn.create_table(&self.table_name, Box::new(iter)).execute().await.map_err(storage)?;
        Ok(())
    }

    async fn table(&self) -> Result<Table> {
        self.conn.open_table(&self.table_name).execute().await.map_err(storage)
    }

    fn to_record_batch(&self, records: &[VectorRecord]) -> Result<RecordBatch> {
        let mut ids = Vec::with_capacity(records.len());
        let mut tags = Vec::with_capacity(records.len());
        let mut vectors: Vec<Option<Vec<Option<f32>>>> = Vec::with_capacity(records.len());
        for r in records {
            if r.embedding.len() != self.dim as usize {
                return Err(Error::corruption(
                    "vector",
                    None,
                    format!(
                        "record {} has dimension {}, table has {}",
                        r.chunk_id,
                        r.embedding.len(),
                        self.dim
                    ),
                ));
            }
            ids.push(r.chunk_id.clone());
            tags.push(r.provider_tag.clone());
            vectors.push(Some(r.embedding.iter().map(|&x| Some(x)).collect()));
        }
        RecordBatch::try_new(
            build_vectors_schema(self.dim),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(tags)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
                    vectors, self.dim,
                )),
            ],
        )
        .map_err(storage)
    }
}

fn read_records(batch: &RecordBatch) -> Result<Vec<VectorRecord>> {
    let ids = batch
        .column_by_name("chunk_id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::corruption("vector", None, "chunk_id column missing"))?;
    let tags = batch
        .column_by_name("provider_tag")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::corruption("vector", None, "provider_tag column missing"))?;
    let vecs = batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
        .ok_or_else(|| Error::corruption("vector", None, "vector column missing"))?;
    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let list = vecs.value(i);
        let embedding = list.as_primitive::<Float32Type>().values().iter().copied().collect();
        out.push(VectorRecord {
            chunk_id: ids.value(i).to_string(),
            provider_tag: tags.value(i).to_string(),
            embedding,
        });
    }
    Ok(out)
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let rb = self.to_record_batch(&records)?;
        let schema = build_vectors_schema(self.dim);
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(rb)].into_iter(), schema));
        let t = self.table().await?;
        let mut mi = t.merge_insert(&["chunk_id"]);
        mi.when_matched_update_all(None).when_not_matched_insert_all();
        let _ = mi.execute(reader).await.map_err(storage)?;
        debug!(records = records.len(), "upserted vectors into lance");
        Ok(())
    }

    async fn remove(&self, ids: &[ChunkId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let quoted: Vec<String> = ids.iter().map(|id| quote(id)).collect();
        let filter = format!("chunk_id IN ({})", quoted.join(","));
        let t = self.table().await?;
        let existing = t.count_rows(Some(filter.clone())).await.map_err(storage)?;
        if existing > 0 {
            t.delete(&filter).await.map_err(storage)?;
        }
        Ok(existing)
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        let t = self.table().await?;
        let mut stream = t
            .query()
            .only_if(format!("chunk_id = {}", quote(id)))
            .limit(1)
            .execute()
            .await
            .map_err(storage)?;
        while let Some(batch) = stream.try_next().await.map_err(storage)? {
            if let Some(r) = read_records(&batch)?.into_iter().next() {
                return Ok(Some(r));
            }
        }
        Ok(None)
    }

    async fn nearest(
        &self,
        query: &[f32],
        provider_tag: &str,
        metric: SimilarityMetric,
        limit: usize,
    ) -> Result<Vec<(ChunkId, f32)>> {
        if query.len() != self.dim as usize {
            return Err(Error::corruption(
                "vector",
                None,
                format!("query has dimension {}, table has {}", query.len(), self.dim),
            ));
        }
        let distance = match metric {
            SimilarityMetric::Cosine => DistanceType::Cosine,
            SimilarityMetric::Dot => DistanceType::Dot,
            SimilarityMetric::Euclidean => DistanceType::L2,
        };
        let t = self.table().await?;
        let mut stream = t
            .vector_search(query.to_vec())
            .map_err(storage)?
            .distance_type(distance)
            .only_if(format!("provider_tag = {}", quote(provider_tag)))
            .limit(limit)
            .execute()
            .await
            .map_err(storage)?;
        let mut scored = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(storage)? {
            for r in read_records(&batch)? {
                scored.push((r.chunk_id, similarity(metric, query, &r.embedding)));
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn ids(&self) -> Result<Vec<ChunkId>> {
        let t = self.table().await?;
        let mut stream =
            t.query().select(Select::columns(&["chunk_id"])).execute().await.map_err(storage)?;
        let mut ids = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(storage)? {
            let col = batch
                .column_by_name("chunk_id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| Error::corruption("vector", None, "chunk_id column missing"))?;
            ids.extend((0..batch.num_rows()).map(|i| col.value(i).to_string()));
        }
        ids.sort();
        Ok(ids)
    }

    async fn len(&self) -> Result<usize> {
        self.table().await?.count_rows(None).await.map_err(storage)
    }
}
