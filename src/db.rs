use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use once_cell::sync::Lazy;
use serde_json::Value;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::agtype::{self, AgEdge, AgVertex};
use crate::config::{AgeSettings, DbSettings};
use crate::error::{LibError, Result};
use crate::merge::PropertyDelta;
use crate::models::{
    Edge, EdgeKey, EntityKind, GraphName, GraphSnapshot, Ident, InternalId, PropertyMap, Vertex,
};
use crate::store::{GraphStore, NewEdge, StoreTransaction, StoredEdge, StoredVertex};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_age_extension(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Opens a pool whose connections have AGE loaded and `ag_catalog` on the search path.
pub async fn connect(settings: &DbSettings) -> Result<PgPool> {
    let dsn = settings.require_dsn()?;
    PgPoolOptions::new()
        .min_connections(settings.pool_min_connections)
        .max_connections(settings.pool_max_connections)
        .acquire_timeout(Duration::from_secs(settings.connection_timeout_secs))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("LOAD 'age'").execute(&mut *conn).await?;
                sqlx::query(r#"SET search_path = ag_catalog, "$user", public"#)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(dsn)
        .await
        .map_err(|err| db_err("Failed to connect to the graph store", err))
}

const VERTEX_TABLE: &str = "_ag_label_vertex";
const EDGE_TABLE: &str = "_ag_label_edge";

#[derive(Debug, Clone, FromRow)]
struct VertexRow {
    v: String,
}

#[derive(Debug, Clone, FromRow)]
struct EdgeRow {
    e: String,
}

#[derive(Debug, Clone, FromRow)]
struct RemovedRow {
    removed: String,
}

#[derive(Debug, Clone, FromRow)]
struct PropertiesRow {
    properties: String,
}

#[derive(Debug, Clone, FromRow)]
struct GraphNameRow {
    name: String,
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::from_sqlx(public, err)
}

/// Wraps a cypher body in the SQL `cypher()` call, casting each returned
/// agtype column to text.
fn cypher(graph: &GraphName, body: &str, columns: &[&str]) -> String {
    let select = columns
        .iter()
        .map(|column| format!("{column}::text AS {column}"))
        .collect::<Vec<_>>()
        .join(", ");
    let types = columns
        .iter()
        .map(|column| format!("{column} ag_catalog.agtype"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {select} FROM ag_catalog.cypher('{graph}', $age${body}$age$) AS ({types})")
}

fn lock_key(graph: &GraphName, scope: &str, key: &str) -> String {
    format!("{graph}\u{1f}{scope}\u{1f}{key}")
}

/// Decodes entities and pulls the identity properties back out of them.
#[derive(Debug, Clone)]
struct Codec {
    age: Arc<AgeSettings>,
}

impl Codec {
    fn ident_match(&self, variable: &str, ident: &Ident) -> String {
        format!(
            "{variable}.`{}` = {}",
            self.age.ident_property,
            agtype::string_literal(ident.as_str())
        )
    }

    fn vertex(&self, text: &str) -> Result<StoredVertex> {
        let raw: AgVertex = agtype::decode_as(text)?;
        let id = raw.internal_id();
        let mut properties = raw.properties;
        let ident = take_ident(&mut properties, &self.age.ident_property, id)?;
        Ok(StoredVertex {
            id,
            ident,
            label: raw.label,
            properties,
        })
    }

    fn edge(&self, text: &str) -> Result<StoredEdge> {
        let raw: AgEdge = agtype::decode_as(text)?;
        let id = raw.internal_id();
        let mut properties = raw.properties;
        let ident = take_ident(&mut properties, &self.age.ident_property, id)?;
        let start_ident = take_ident(&mut properties, &self.age.start_ident_property, id)?;
        let end_ident = take_ident(&mut properties, &self.age.end_ident_property, id)?;
        Ok(StoredEdge {
            id,
            ident,
            label: raw.label,
            start_ident,
            end_ident,
            properties,
        })
    }
}

fn take_ident(properties: &mut PropertyMap, key: &str, id: InternalId) -> Result<Ident> {
    match properties.shift_remove(key) {
        Some(Value::String(value)) => Ident::new(value),
        other => Err(LibError::unknown(
            "Stored entity has no usable identity property",
            anyhow!("entity {} has {} = {:?}", id, key, other),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct AgeStore {
    pool: PgPool,
    codec: Codec,
}

impl AgeStore {
    pub fn new(pool: PgPool, age: AgeSettings) -> Self {
        Self {
            pool,
            codec: Codec { age: Arc::new(age) },
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin_locked(&self, graph: &GraphName) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        advisory_lock(&mut tx, &lock_key(graph, "graph", "")).await?;
        Ok(tx)
    }
}

async fn advisory_lock(tx: &mut Transaction<'static, Postgres>, key: &str) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to lock graph entity", err))?;
    Ok(())
}

async fn graph_exists_in<'e, E>(executor: E, graph: &GraphName) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let exists: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS(
            SELECT 1
            FROM ag_catalog.ag_graph
            WHERE name = $1::name
        )
        "#,
    )
    .bind(graph.as_str())
    .fetch_one(executor)
    .await
    .map_err(|err| db_err("Failed to query graph", err))?;
    Ok(exists.0)
}

impl GraphStore for AgeStore {
    type Tx = AgeTransaction;

    async fn begin(&self) -> Result<AgeTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        Ok(AgeTransaction {
            tx,
            codec: self.codec.clone(),
        })
    }

    async fn graph_exists(&self, graph: &GraphName) -> Result<bool> {
        graph_exists_in(&self.pool, graph).await
    }

    async fn create_graph(&self, graph: &GraphName) -> Result<bool> {
        let mut tx = self.begin_locked(graph).await?;
        if graph_exists_in(&mut *tx, graph).await? {
            return Ok(false);
        }

        sqlx::query("SELECT ag_catalog.create_graph($1::name)")
            .bind(graph.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to create graph", err))?;
        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;
        Ok(true)
    }

    async fn list_graphs(&self) -> Result<Vec<GraphName>> {
        let rows = sqlx::query_as::<_, GraphNameRow>(
            r#"
            SELECT name::text AS name
            FROM ag_catalog.ag_graph
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to list graphs", err))?;

        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            match GraphName::new(row.name) {
                Ok(name) => names.push(name),
                Err(err) => tracing::warn!(error = %err, "skipping graph with unsupported name"),
            }
        }
        Ok(names)
    }

    async fn drop_graph(&self, graph: &GraphName) -> Result<bool> {
        let mut tx = self.begin_locked(graph).await?;
        if !graph_exists_in(&mut *tx, graph).await? {
            return Ok(false);
        }

        sqlx::query("SELECT ag_catalog.drop_graph($1::name, true)")
            .bind(graph.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to drop graph", err))?;
        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;
        Ok(true)
    }

    async fn snapshot(&self, graph: &GraphName) -> Result<Option<GraphSnapshot>> {
        if !self.graph_exists(graph).await? {
            return Ok(None);
        }

        let vertex_rows =
            sqlx::query_as::<_, VertexRow>(&cypher(graph, "MATCH (v) RETURN v", &["v"]))
                .persistent(false)
                .fetch_all(&self.pool)
                .await
                .map_err(|err| db_err("Failed to query graph vertices", err))?;
        let edge_rows =
            sqlx::query_as::<_, EdgeRow>(&cypher(graph, "MATCH ()-[e]->() RETURN e", &["e"]))
                .persistent(false)
                .fetch_all(&self.pool)
                .await
                .map_err(|err| db_err("Failed to query graph edges", err))?;

        let mut vertices = Vec::with_capacity(vertex_rows.len());
        for row in vertex_rows {
            match self.codec.vertex(&row.v) {
                Ok(vertex) => vertices.push(Vertex::from(vertex)),
                Err(err) => tracing::warn!(graph = %graph, error = %err, "skipping unmanaged vertex"),
            }
        }
        let mut edges = Vec::with_capacity(edge_rows.len());
        for row in edge_rows {
            match self.codec.edge(&row.e) {
                Ok(edge) => edges.push(Edge::from(edge)),
                Err(err) => tracing::warn!(graph = %graph, error = %err, "skipping unmanaged edge"),
            }
        }
        vertices.sort_by(|a, b| a.ident.cmp(&b.ident));
        edges.sort_by(|a, b| a.ident.cmp(&b.ident));

        Ok(Some(GraphSnapshot {
            name: graph.clone(),
            vertices,
            edges,
        }))
    }
}

pub struct AgeTransaction {
    tx: Transaction<'static, Postgres>,
    codec: Codec,
}

impl AgeTransaction {
    async fn fetch_vertex(&mut self, graph: &GraphName, body: &str) -> Result<Option<StoredVertex>> {
        let row = sqlx::query_as::<_, VertexRow>(&cypher(graph, body, &["v"]))
            .persistent(false)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| db_err("Failed to query vertex", err))?;
        row.map(|row| self.codec.vertex(&row.v)).transpose()
    }

    async fn fetch_edge(&mut self, graph: &GraphName, body: &str) -> Result<Option<StoredEdge>> {
        let row = sqlx::query_as::<_, EdgeRow>(&cypher(graph, body, &["e"]))
            .persistent(false)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| db_err("Failed to query edge", err))?;
        row.map(|row| self.codec.edge(&row.e)).transpose()
    }

    async fn fetch_removed(&mut self, graph: &GraphName, body: &str) -> Result<Option<usize>> {
        let row = sqlx::query_as::<_, RemovedRow>(&cypher(graph, body, &["removed"]))
            .persistent(false)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| db_err("Failed to delete graph entity", err))?;
        row.map(|row| agtype::decode_as::<usize>(&row.removed))
            .transpose()
    }

    /// Rewrites the whole property map in one statement. Cypher `SET x = null`
    /// removes the key, so this goes to the label table directly.
    async fn write_properties(
        &mut self,
        graph: &GraphName,
        kind: EntityKind,
        id: InternalId,
        delta: &PropertyDelta,
    ) -> Result<()> {
        let table = match kind {
            EntityKind::Vertex => VERTEX_TABLE,
            EntityKind::Edge => EDGE_TABLE,
        };
        let select = format!(
            r#"
            SELECT properties::text AS properties
            FROM "{graph}"."{table}"
            WHERE id = $1::text::ag_catalog.graphid
            FOR UPDATE
            "#
        );
        let row = sqlx::query_as::<_, PropertiesRow>(&select)
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| db_err("Failed to read properties", err))?;
        let Some(row) = row else {
            return Err(LibError::not_found(
                "Graph entity not found",
                anyhow!("{} {} not found in graph {}", kind, id, graph),
            ));
        };

        let mut properties: PropertyMap = agtype::decode_as(&row.properties)?;
        delta.apply(&mut properties);
        let encoded = serde_json::to_string(&properties).map_err(|err| {
            LibError::invalid("Properties could not be encoded", anyhow!(err))
        })?;

        let update = format!(
            r#"
            UPDATE "{graph}"."{table}"
            SET properties = $1::text::ag_catalog.agtype
            WHERE id = $2::text::ag_catalog.graphid
            "#
        );
        sqlx::query(&update)
            .bind(encoded)
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| db_err("Failed to write properties", err))?;
        Ok(())
    }
}

impl StoreTransaction for AgeTransaction {
    async fn lock_entity(&mut self, graph: &GraphName, kind: EntityKind, key: &str) -> Result<()> {
        advisory_lock(&mut self.tx, &lock_key(graph, kind.as_str(), key)).await
    }

    async fn find_vertex(&mut self, graph: &GraphName, ident: &Ident) -> Result<Option<StoredVertex>> {
        let body = format!(
            "MATCH (v) WHERE {} RETURN v LIMIT 1",
            self.codec.ident_match("v", ident)
        );
        self.fetch_vertex(graph, &body).await
    }

    async fn insert_vertex(
        &mut self,
        graph: &GraphName,
        ident: &Ident,
        label: &str,
    ) -> Result<StoredVertex> {
        let body = format!(
            "CREATE (v:`{label}` {{`{}`: {}}}) RETURN v",
            self.codec.age.ident_property,
            agtype::string_literal(ident.as_str())
        );
        self.fetch_vertex(graph, &body).await?.ok_or_else(|| {
            LibError::unknown(
                "Failed to create vertex",
                anyhow!("CREATE returned no vertex for '{}' in graph {}", ident, graph),
            )
        })
    }

    async fn update_vertex_properties(
        &mut self,
        graph: &GraphName,
        id: InternalId,
        delta: &PropertyDelta,
    ) -> Result<()> {
        self.write_properties(graph, EntityKind::Vertex, id, delta)
            .await
    }

    async fn delete_vertex(&mut self, graph: &GraphName, id: InternalId) -> Result<usize> {
        let body = format!(
            "MATCH (v) WHERE id(v) = {id} \
             OPTIONAL MATCH (v)-[e]-() \
             WITH v, count(DISTINCT e) AS removed \
             DETACH DELETE v \
             RETURN removed"
        );
        self.fetch_removed(graph, &body).await?.ok_or_else(|| {
            LibError::not_found(
                "Vertex not found",
                anyhow!("vertex {} not found in graph {}", id, graph),
            )
        })
    }

    async fn find_edge(&mut self, graph: &GraphName, key: &EdgeKey) -> Result<Option<StoredEdge>> {
        let names = &self.codec.age;
        let body = format!(
            "MATCH ()-[e:`{}`]->() WHERE e.`{}` = {} AND e.`{}` = {} RETURN e LIMIT 1",
            key.label,
            names.start_ident_property,
            agtype::string_literal(key.start_ident.as_str()),
            names.end_ident_property,
            agtype::string_literal(key.end_ident.as_str()),
        );
        self.fetch_edge(graph, &body).await
    }

    async fn find_edge_by_ident(
        &mut self,
        graph: &GraphName,
        ident: &Ident,
    ) -> Result<Option<StoredEdge>> {
        let body = format!(
            "MATCH ()-[e]->() WHERE {} RETURN e LIMIT 1",
            self.codec.ident_match("e", ident)
        );
        self.fetch_edge(graph, &body).await
    }

    async fn insert_edge(&mut self, graph: &GraphName, edge: NewEdge<'_>) -> Result<Option<StoredEdge>> {
        let names = &self.codec.age;
        let body = format!(
            "MATCH (s), (t) \
             WHERE id(s) = {start} AND id(t) = {end} AND {start_match} AND {end_match} \
             CREATE (s)-[e:`{label}` {{`{ident_key}`: {ident}, `{start_key}`: {start_ident}, `{end_key}`: {end_ident}}}]->(t) \
             RETURN e",
            start = edge.start,
            end = edge.end,
            start_match = self.codec.ident_match("s", &edge.key.start_ident),
            end_match = self.codec.ident_match("t", &edge.key.end_ident),
            label = edge.key.label,
            ident_key = names.ident_property,
            ident = agtype::string_literal(edge.ident.as_str()),
            start_key = names.start_ident_property,
            start_ident = agtype::string_literal(edge.key.start_ident.as_str()),
            end_key = names.end_ident_property,
            end_ident = agtype::string_literal(edge.key.end_ident.as_str()),
        );
        self.fetch_edge(graph, &body).await
    }

    async fn update_edge_properties(
        &mut self,
        graph: &GraphName,
        id: InternalId,
        delta: &PropertyDelta,
    ) -> Result<()> {
        self.write_properties(graph, EntityKind::Edge, id, delta)
            .await
    }

    async fn delete_edge(&mut self, graph: &GraphName, id: InternalId) -> Result<()> {
        let body = format!(
            "MATCH ()-[e]->() WHERE id(e) = {id} \
             WITH e, count(e) AS removed \
             DELETE e \
             RETURN removed"
        );
        match self.fetch_removed(graph, &body).await? {
            Some(_) => Ok(()),
            None => Err(LibError::not_found(
                "Edge not found",
                anyhow!("edge {} not found in graph {}", id, graph),
            )),
        }
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))
    }
}
