//! [`TransactionIndexer`] backed by a subgraph's GraphQL API.

use std::time::Duration;

use alloy::primitives::{
    Address,
    B256,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    IndexedTransaction,
    IndexedTransactions,
    IndexerError,
    TransactionIndexer,
};

const TRANSACTION_FIELDS: &str = r"
    fragment TransactionFields on Transaction {
        hash
        channelId
        data
        encryptedData
        encryptionMethod
        publicKeys
        encryptedKeys
        topics
        blockNumber
        blockTimestamp
        transactionHash
        smartContractAddress
        size
    }
";

#[derive(Debug, Clone)]
pub struct SubgraphIndexerConfig {
    pub graphql_url: String,
    pub timeout: Duration,
}

/// Indexer client querying a subgraph over GraphQL.
#[derive(Debug, Clone)]
pub struct SubgraphIndexer {
    client: Client,
    graphql_url: String,
    timeout: Duration,
}

impl SubgraphIndexer {
    pub fn new(config: SubgraphIndexerConfig) -> Self {
        Self {
            client: Client::new(),
            graphql_url: config.graphql_url,
            timeout: config.timeout,
        }
    }

    async fn execute_query<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, IndexerError> {
        let body = serde_json::json!({
            "query": query,
            "variables": variables,
        });

        let response = self
            .client
            .post(&self.graphql_url)
            // the client is built without a timeout, every query carries its own
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| IndexerError::RequestFailed(e.to_string()))?;

        let gql_response: GraphqlResponse<T> = response
            .json()
            .await
            .map_err(|e| IndexerError::ParseError(e.to_string()))?;

        if let Some(errors) = gql_response.errors {
            let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            return Err(IndexerError::RequestFailed(messages.join("; ")));
        }

        gql_response
            .data
            .ok_or_else(|| IndexerError::ParseError("No data in response".to_string()))
    }

    async fn query_transactions(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<IndexedTransactions, IndexerError> {
        let query = format!("{query}\n{TRANSACTION_FIELDS}");
        let data: TransactionsData = self.execute_query(&query, variables).await?;

        let transactions = data
            .transactions
            .into_iter()
            .map(TransactionNode::into_indexed)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(IndexedTransactions {
            transactions,
            block_number: data.meta.block_number()?,
        })
    }
}

#[async_trait]
impl TransactionIndexer for SubgraphIndexer {
    async fn transactions_by_hash(&self, hash: &str) -> Result<IndexedTransactions, IndexerError> {
        let query = r"
            query TransactionsByHash($hash: String!) {
                _meta { block { number } }
                transactions(
                    where: { hash: $hash }
                    orderBy: blockTimestamp
                    orderDirection: asc
                ) {
                    ...TransactionFields
                }
            }
        ";

        self.query_transactions(query, serde_json::json!({ "hash": hash }))
            .await
    }

    async fn transactions_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<IndexedTransactions, IndexerError> {
        let query = r"
            query TransactionsByChannel($channelId: String!) {
                _meta { block { number } }
                transactions(
                    where: { channelId: $channelId }
                    orderBy: blockTimestamp
                    orderDirection: asc
                ) {
                    ...TransactionFields
                }
            }
        ";

        self.query_transactions(query, serde_json::json!({ "channelId": channel_id }))
            .await
    }

    async fn transactions_by_topics(
        &self,
        topics: &[String],
    ) -> Result<IndexedTransactions, IndexerError> {
        let query = r"
            query TransactionsByTopics($where: Transaction_filter!) {
                _meta { block { number } }
                transactions(
                    where: $where
                    orderBy: blockTimestamp
                    orderDirection: asc
                ) {
                    ...TransactionFields
                }
            }
        ";

        let any_topic: Vec<_> = topics
            .iter()
            .map(|topic| serde_json::json!({ "topics_contains": [topic] }))
            .collect();

        self.query_transactions(query, serde_json::json!({ "where": { "or": any_topic } }))
            .await
    }

    async fn block_number(&self) -> Result<u64, IndexerError> {
        let query = r"
            query BlockNumber {
                _meta { block { number } }
            }
        ";

        let data: MetaData = self.execute_query(query, serde_json::json!({})).await?;
        data.meta.block_number()
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MetaData {
    #[serde(rename = "_meta")]
    meta: MetaBlock,
}

#[derive(Debug, Deserialize)]
struct TransactionsData {
    #[serde(rename = "_meta")]
    meta: MetaBlock,
    transactions: Vec<TransactionNode>,
}

#[derive(Debug, Deserialize)]
struct MetaBlock {
    block: Option<MetaBlockInner>,
}

impl MetaBlock {
    fn block_number(&self) -> Result<u64, IndexerError> {
        let number = self
            .block
            .as_ref()
            .ok_or_else(|| IndexerError::ParseError("Missing indexer block".to_string()))?
            .number;
        u64::try_from(number).map_err(|e| IndexerError::ParseError(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct MetaBlockInner {
    number: i64,
}

/// Numeric fields arrive as strings (`BigInt`) or numbers (`Int`) depending
/// on the subgraph schema.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GraphqlNumber {
    Number(u64),
    Text(String),
}

impl GraphqlNumber {
    fn parse(&self, field: &str) -> Result<u64, IndexerError> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Text(text) => text
                .parse()
                .map_err(|e| IndexerError::ParseError(format!("{field}: {e}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionNode {
    hash: String,
    channel_id: String,
    data: Option<String>,
    encrypted_data: Option<String>,
    encryption_method: Option<String>,
    #[serde(default)]
    public_keys: Option<Vec<String>>,
    #[serde(default)]
    encrypted_keys: Option<Vec<String>>,
    #[serde(default)]
    topics: Option<Vec<String>>,
    block_number: GraphqlNumber,
    block_timestamp: GraphqlNumber,
    transaction_hash: String,
    smart_contract_address: String,
    size: GraphqlNumber,
}

impl TransactionNode {
    fn into_indexed(self) -> Result<IndexedTransaction, IndexerError> {
        Ok(IndexedTransaction {
            block_number: self.block_number.parse("blockNumber")?,
            block_timestamp: self.block_timestamp.parse("blockTimestamp")?,
            size: self.size.parse("size")?,
            transaction_hash: self
                .transaction_hash
                .parse::<B256>()
                .map_err(|e| IndexerError::ParseError(e.to_string()))?,
            smart_contract_address: self
                .smart_contract_address
                .parse::<Address>()
                .map_err(|e| IndexerError::ParseError(e.to_string()))?,
            hash: self.hash,
            channel_id: self.channel_id,
            data: self.data,
            encrypted_data: self.encrypted_data,
            encryption_method: self.encryption_method,
            public_keys: self.public_keys.unwrap_or_default(),
            encrypted_keys: self.encrypted_keys.unwrap_or_default(),
            topics: self.topics.unwrap_or_default(),
        })
    }
}
