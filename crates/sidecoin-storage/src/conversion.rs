//! Cross-chain conversion requests awaiting mint or burn.

use crate::{Column, KeyValueStore, Result, WriteBatch};
use codec::{Decode, Encode};
use sidecoin_primitives::Height;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ConversionRequestType {
    #[codec(index = 0)]
    Mint,
    #[codec(index = 1)]
    Burn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ConversionRequestStatus {
    #[codec(index = 0)]
    Unprocessed,
    #[codec(index = 1)]
    OriginatorNotSubmitted,
    #[codec(index = 2)]
    OriginatorSubmitted,
    #[codec(index = 3)]
    VoteFinalised,
    #[codec(index = 4)]
    NotOriginator,
    #[codec(index = 5)]
    Processed,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ConversionRequest {
    pub request_id: String,
    pub request_type: ConversionRequestType,
    pub processed: bool,
    pub request_status: ConversionRequestStatus,
    /// Amount in satoshis.
    pub amount: u64,
    /// Height of the counter chain block the request was observed in.
    pub block_height: Height,
    pub destination_address: String,
}

/// Store of conversion requests keyed by request id.
pub struct ConversionRequestRepository<S: ?Sized> {
    db: Arc<S>,
}

impl<S: KeyValueStore + ?Sized> ConversionRequestRepository<S> {
    pub fn new(db: Arc<S>) -> Self {
        Self { db }
    }

    /// Saves the request, replacing any request with the same id.
    pub fn save(&self, request: &ConversionRequest) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            Column::ConversionRequests,
            request.request_id.as_bytes().to_vec(),
            request.encode(),
        );
        self.db.write(batch)?;

        tracing::debug!(
            request_id = %request.request_id,
            status = ?request.request_status,
            "Saved conversion request"
        );

        Ok(())
    }

    pub fn get(&self, request_id: &str) -> Result<Option<ConversionRequest>> {
        Ok(self
            .db
            .get(Column::ConversionRequests, request_id.as_bytes())?
            .map(|bytes| ConversionRequest::decode(&mut bytes.as_slice()))
            .transpose()?)
    }

    /// Returns the requests of the given type, ordered by id.
    pub fn get_all(
        &self,
        request_type: ConversionRequestType,
        only_unprocessed: bool,
    ) -> Result<Vec<ConversionRequest>> {
        let mut requests = Vec::new();
        for (_, value) in self.db.entries(Column::ConversionRequests)? {
            let request = ConversionRequest::decode(&mut value.as_slice())?;
            if request.request_type == request_type && !(only_unprocessed && request.processed) {
                requests.push(request);
            }
        }
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn request(id: &str, request_type: ConversionRequestType, processed: bool) -> ConversionRequest {
        ConversionRequest {
            request_id: id.to_string(),
            request_type,
            processed,
            request_status: if processed {
                ConversionRequestStatus::Processed
            } else {
                ConversionRequestStatus::Unprocessed
            },
            amount: 42,
            block_height: 100,
            destination_address: "0xdestination".to_string(),
        }
    }

    #[test]
    fn enums_are_stored_as_integers() {
        assert_eq!(ConversionRequestType::Burn.encode(), vec![1]);
        assert_eq!(ConversionRequestStatus::Processed.encode(), vec![5]);
    }

    #[test]
    fn save_overwrites_and_missing_is_none() {
        let repo = ConversionRequestRepository::new(Arc::new(MemoryStore::new()));
        assert_eq!(repo.get("missing").unwrap(), None);

        let mut req = request("a", ConversionRequestType::Mint, false);
        repo.save(&req).unwrap();
        req.processed = true;
        req.request_status = ConversionRequestStatus::Processed;
        repo.save(&req).unwrap();

        assert_eq!(repo.get("a").unwrap(), Some(req));
    }

    #[test]
    fn get_all_filters_type_and_processed() {
        let repo = ConversionRequestRepository::new(Arc::new(MemoryStore::new()));
        repo.save(&request("c", ConversionRequestType::Mint, false)).unwrap();
        repo.save(&request("a", ConversionRequestType::Mint, true)).unwrap();
        repo.save(&request("b", ConversionRequestType::Burn, false)).unwrap();

        let ids = |requests: Vec<ConversionRequest>| {
            requests.into_iter().map(|r| r.request_id).collect::<Vec<_>>()
        };
        assert_eq!(ids(repo.get_all(ConversionRequestType::Mint, false).unwrap()), ["a", "c"]);
        assert_eq!(ids(repo.get_all(ConversionRequestType::Mint, true).unwrap()), ["c"]);
        assert_eq!(ids(repo.get_all(ConversionRequestType::Burn, true).unwrap()), ["b"]);
    }
}
