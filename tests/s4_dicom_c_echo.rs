//! End-to-end DICOM association: a `DicomSourceConnector` accepts a real TCP
//! connection, negotiates the verification presentation context, and answers
//! a C-ECHO sent by a `DicomDestinationConnector` against the same port.

use channel_runtime::connector::{Connector, DestinationConnector, ResponseStatus};
use channel_runtime::dicom::association::VERIFICATION_SOP_CLASS_UID;
use channel_runtime::dicom::{DicomAcceptPolicy, DicomDestinationConnector, DicomSourceConnector};
use channel_runtime::evaluator::NoopEvaluator;
use channel_runtime::model::Maps;
use channel_runtime::pipeline::Pipeline;
use channel_runtime::store::InMemoryStore;
use channel_runtime::EventBus;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn verification_c_echo_round_trips_against_a_live_association() {
    let store: Arc<dyn channel_runtime::store::MessageStore> = Arc::new(InMemoryStore::new());
    let pipeline = Arc::new(Pipeline::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        store,
        Arc::new(NoopEvaluator),
        None,
        None,
        None,
        Vec::new(),
        false,
        None,
        EventBus::new(16),
        false,
        Arc::new(dashmap::DashMap::new()),
        Arc::new(std::collections::HashMap::new()),
    ));

    let policy = DicomAcceptPolicy {
        accepted_sop_classes: vec![VERIFICATION_SOP_CLASS_UID.to_string()],
        accepted_transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        max_pdu_length: 16384,
    };
    let mut source = DicomSourceConnector::new("127.0.0.1".to_string(), 17001, policy, pipeline);
    source.start().await.expect("DICOM source failed to bind");

    let destination = DicomDestinationConnector::new(
        "127.0.0.1".to_string(),
        17001,
        "TEST-SCP".to_string(),
        "TEST-SCU".to_string(),
        VERIFICATION_SOP_CLASS_UID.to_string(),
        "1.2.840.10008.1.2".to_string(),
        16384,
    );

    let response = destination.send("", &Maps::default()).await.expect("C-ECHO send failed");
    assert_eq!(response.status, ResponseStatus::Sent);

    source.stop().await.expect("DICOM source failed to stop");
}
