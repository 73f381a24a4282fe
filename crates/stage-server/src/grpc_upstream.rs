//! `UpstreamSource` backed by the generated `RawLedgerSource` gRPC client
//! (spec §6 `SOURCE_ENDPOINT`).
//!
//! Convention with the upstream stage: reaching the current tip is signaled
//! as `Status::out_of_range` with a message of the form `latest=<sequence>`,
//! which this adapter turns into [`stage_runtime::UpstreamSignal::CursorBoundary`]
//! rather than a transport error.

use futures::stream::BoxStream;
use futures::StreamExt;
use stage_core::{CoreError, RawLedger};
use stage_runtime::{UpstreamItem, UpstreamSignal, UpstreamSource};
use tonic::transport::Channel;
use tonic::Status;

use stage_proto::raw_ledger_source_client::RawLedgerSourceClient;
use stage_proto::SubscribeRawLedgersRequest;

pub struct GrpcUpstream {
    endpoint: String,
}

impl GrpcUpstream {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl UpstreamSource for GrpcUpstream {
    async fn open(&self, effective_start: u32) -> Result<BoxStream<'static, UpstreamItem>, CoreError> {
        let channel = Channel::from_shared(self.endpoint.clone())
            .map_err(|e| CoreError::Transport(Box::new(e)))?
            .connect()
            .await
            .map_err(|e| CoreError::Transport(Box::new(e)))?;
        let mut client = RawLedgerSourceClient::new(channel);

        let request = tonic::Request::new(SubscribeRawLedgersRequest {
            start_ledger: effective_start,
        });
        let stream = client
            .subscribe_raw_ledgers(request)
            .await
            .map_err(|e| CoreError::Transport(Box::new(e)))?
            .into_inner();

        let mapped = stream.map(|item| match item {
            Ok(raw) => Ok(UpstreamSignal::Ledger(RawLedger::new(
                raw.sequence,
                raw.network_passphrase,
                raw.ledger_close_meta_xdr,
            ))),
            Err(status) => match parse_cursor_boundary(&status) {
                Some(latest) => Ok(UpstreamSignal::CursorBoundary { latest }),
                None => Err(CoreError::Transport(Box::new(status))),
            },
        });

        Ok(Box::pin(mapped))
    }
}

fn parse_cursor_boundary(status: &Status) -> Option<u32> {
    if status.code() != tonic::Code::OutOfRange {
        return None;
    }
    status
        .message()
        .strip_prefix("latest=")
        .and_then(|rest| rest.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_with_latest_prefix_parses() {
        let status = Status::out_of_range("latest=42500");
        assert_eq!(parse_cursor_boundary(&status), Some(42500));
    }

    #[test]
    fn non_out_of_range_status_is_not_a_boundary() {
        let status = Status::unavailable("connection reset");
        assert_eq!(parse_cursor_boundary(&status), None);
    }

    #[test]
    fn out_of_range_without_the_expected_message_format_is_not_a_boundary() {
        let status = Status::out_of_range("ledger sequence too far in the future");
        assert_eq!(parse_cursor_boundary(&status), None);
    }
}
