use std::path::Path;

use async_trait::async_trait;
use bson::Document;
use mongodb::{
    error::{Error, ErrorKind, WriteFailure},
    options::{
        ClientOptions, FindOneAndUpdateOptions, IndexOptions, ReturnDocument, Tls, TlsOptions,
    },
    Client, Collection, IndexModel,
};
use tracing::instrument;

use super::{DocumentStore, IndexSpec, ReturnPolicy, StoreError};
use crate::config::{MongoDbConfig, DEFAULT_DATABASE};

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Job collection in a MongoDB database. Cloning shares the underlying connection pool.
#[derive(Clone, Debug)]
pub struct MongoDbStore {
    collection: Collection<Document>,
}

impl MongoDbStore {
    pub async fn new(config: &MongoDbConfig) -> Result<Self, Error> {
        let client = Self::new_client(&config.uri, config.cert_file.as_deref()).await?;
        let database = match &config.database {
            Some(name) => client.database(name),
            None => client
                .default_database()
                .unwrap_or_else(|| client.database(DEFAULT_DATABASE)),
        };

        Ok(Self::from_collection(database.collection(&config.collection)))
    }

    pub fn from_collection(collection: Collection<Document>) -> Self {
        Self { collection }
    }

    async fn new_client(uri: &str, ca_file: Option<&Path>) -> Result<Client, Error> {
        let mut options = ClientOptions::parse(uri).await?;
        if let Some(ca_file) = ca_file {
            let mut tls_options = TlsOptions::default();
            tls_options.ca_file_path = Some(ca_file.to_path_buf());
            options.tls = Some(Tls::Enabled(tls_options));
        }
        Client::with_options(options)
    }
}

fn classify(err: Error, context: &'static str) -> StoreError {
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY_CODE => {
            return StoreError::DuplicateKey(write_error.message.clone());
        }
        ErrorKind::Command(command_error) if command_error.code == DUPLICATE_KEY_CODE => {
            return StoreError::DuplicateKey(command_error.message.clone());
        }
        _ => {}
    }

    let unavailable = matches!(
        &*err.kind,
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. }
    );
    let err = anyhow::Error::new(err).context(context);
    if unavailable {
        StoreError::Unavailable(err)
    } else {
        StoreError::Other(err)
    }
}

#[async_trait]
impl DocumentStore for MongoDbStore {
    #[instrument(skip_all, err)]
    async fn insert_one(&self, document: Document) -> Result<(), StoreError> {
        self.collection
            .insert_one(document, None)
            .await
            .map_err(|e| classify(e, "Failed to add job to the queue"))?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn find_one(&self, filter: Document) -> Result<Option<Document>, StoreError> {
        self.collection
            .find_one(filter, None)
            .await
            .map_err(|e| classify(e, "Failed to find job in the queue"))
    }

    #[instrument(skip_all, err)]
    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        sort: Option<Document>,
        return_policy: ReturnPolicy,
    ) -> Result<Option<Document>, StoreError> {
        let mut options = FindOneAndUpdateOptions::default();
        options.sort = sort;
        options.return_document = Some(match return_policy {
            ReturnPolicy::Before => ReturnDocument::Before,
            ReturnPolicy::After => ReturnDocument::After,
        });

        self.collection
            .find_one_and_update(filter, update, options)
            .await
            .map_err(|e| classify(e, "Failed to update job"))
    }

    #[instrument(skip_all, err, fields(index = %index.name))]
    async fn create_index(&self, index: IndexSpec) -> Result<(), StoreError> {
        let mut options = IndexOptions::default();
        options.name = Some(index.name);
        options.unique = Some(index.unique);
        options.partial_filter_expression = index.partial_filter;
        let model = IndexModel::builder().keys(index.keys).options(options).build();

        // Recreating an identical index is acknowledged by the server as a no-op.
        self.collection
            .create_index(model, None)
            .await
            .map_err(|e| classify(e, "Failed to create job index"))?;
        Ok(())
    }
}
