mod common;

use common::{node, RecordingCompute};
use futures::TryStreamExt;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use vnet::link::{LinkError, LinkState, UdpLink, DEFAULT_DATA_LINK_TYPE};
use vnet_core::{
    compute::{Method, RemoteError, Request},
    nio::Filters,
    node::NodeType,
    notification::NotificationBus,
    Id,
};

fn paths(requests: &[Request]) -> Vec<(Method, String)> {
    requests
        .iter()
        .map(|request| (request.method, request.path.clone()))
        .collect()
}

struct TwoHosts {
    project: Id,
    a: Arc<RecordingCompute>,
    b: Arc<RecordingCompute>,
}

fn two_hosts() -> TwoHosts {
    TwoHosts {
        project: Id::random(),
        a: Arc::new(
            RecordingCompute::new("remote1")
                .with_subnet("192.168.1.1", "192.168.1.2")
                .with_udp_ports(&[1024]),
        ),
        b: Arc::new(RecordingCompute::new("remote2").with_udp_ports(&[2048])),
    }
}

async fn established(hosts: &TwoHosts) -> UdpLink {
    let mut link = UdpLink::new(NotificationBus::default());
    let pc1 = node(hosts.project, &hosts.a, "PC1", NodeType::Vpcs, &[(0, 4)]);
    let pc2 = node(hosts.project, &hosts.b, "PC2", NodeType::Vpcs, &[(3, 1)]);
    link.add_node(pc1, 0, 4).await.unwrap();
    link.add_node(pc2, 3, 1).await.unwrap();
    hosts.a.clear();
    hosts.b.clear();
    link
}

#[tokio::test]
#[ntest::timeout(5000)]
async fn binds_each_side_to_the_other() {
    let hosts = two_hosts();
    let mut link = UdpLink::new(NotificationBus::default());
    let pc1 = node(hosts.project, &hosts.a, "PC1", NodeType::Vpcs, &[(0, 4)]);
    let pc2 = node(hosts.project, &hosts.b, "PC2", NodeType::Vpcs, &[(3, 1)]);
    let (pc1_path, pc2_path) = (pc1.node_path(), pc2.node_path());

    link.add_node(pc1, 0, 4).await.unwrap();
    assert_eq!(link.state(), LinkState::OneEndpoint);
    assert!(hosts.a.requests().is_empty());

    link.add_node(pc2, 3, 1).await.unwrap();
    assert_eq!(link.state(), LinkState::Established);

    let udp = format!("/projects/{}/ports/udp", hosts.project);
    let a_requests = hosts.a.requests();
    assert_eq!(
        paths(&a_requests),
        vec![
            (Method::Post, udp.clone()),
            (Method::Post, format!("{}/adapters/0/ports/4/nio", pc1_path)),
        ]
    );
    assert_eq!(
        a_requests[1].body,
        Some(json!({"lport": 1024, "rhost": "192.168.1.2", "rport": 2048, "type": "nio_udp"}))
    );

    let b_requests = hosts.b.requests();
    assert_eq!(
        paths(&b_requests),
        vec![
            (Method::Post, udp),
            (Method::Post, format!("{}/adapters/3/ports/1/nio", pc2_path)),
        ]
    );
    assert_eq!(
        b_requests[1].body,
        Some(json!({"lport": 2048, "rhost": "192.168.1.1", "rport": 1024, "type": "nio_udp"}))
    );
    assert_eq!(link.nios()[0].lport(), 1024);
    assert_eq!(link.nios()[1].lport(), 2048);
}

#[tokio::test]
async fn endpoint_rules() {
    let hosts = two_hosts();
    let mut link = UdpLink::new(NotificationBus::default());
    let pc1 = node(hosts.project, &hosts.a, "PC1", NodeType::Vpcs, &[(0, 4)]);
    match link.add_node(pc1.clone(), 1, 0).await {
        Err(LinkError::PortAddress { node, address }) => {
            assert_eq!(node, "PC1");
            assert_eq!(address.to_string(), "1/0");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(link.state(), LinkState::Empty);

    link.add_node(pc1.clone(), 0, 4).await.unwrap();
    let pc2 = node(hosts.project, &hosts.b, "PC2", NodeType::Vpcs, &[(3, 1)]);
    link.add_node(pc2.clone(), 3, 1).await.unwrap();
    assert!(matches!(
        link.add_node(pc2.clone(), 3, 1).await,
        Err(LinkError::Full(_))
    ));

    link.delete().await.unwrap();
    assert!(matches!(
        link.add_node(pc2, 3, 1).await,
        Err(LinkError::Deleted(_))
    ));
}

#[tokio::test]
async fn failed_bind_rolls_back() {
    let hosts = two_hosts();
    hosts.b.fail(Method::Post, "/nio");
    let mut link = UdpLink::new(NotificationBus::default());
    let pc1 = node(hosts.project, &hosts.a, "PC1", NodeType::Vpcs, &[(0, 4)]);
    let pc2 = node(hosts.project, &hosts.b, "PC2", NodeType::Vpcs, &[(3, 1)]);
    let pc1_nio = format!("{}/adapters/0/ports/4/nio", pc1.node_path());
    let pc2_path = pc2.node_path();

    link.add_node(pc1, 0, 4).await.unwrap();
    match link.add_node(pc2, 3, 1).await {
        Err(LinkError::Remote(RemoteError::Status { compute, status, .. })) => {
            assert_eq!(compute, "remote2");
            assert_eq!(status, 409);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(link.state(), LinkState::OneEndpoint);
    assert_eq!(link.endpoints().len(), 1);
    assert_eq!(
        paths(&hosts.a.requests()).last(),
        Some(&(Method::Delete, pc1_nio))
    );
    // The refusing side undid its own bind, so only its port is handed back
    let udp = format!("/projects/{}/ports/udp", hosts.project);
    assert_eq!(
        paths(&hosts.b.requests()),
        vec![
            (Method::Post, udp.clone()),
            (Method::Post, format!("{}/adapters/3/ports/1/nio", pc2_path)),
            (Method::Delete, format!("{}/2048", udp)),
        ]
    );
}

#[tokio::test]
async fn unanswered_bind_is_removed() {
    let hosts = two_hosts();
    hosts.b.time_out(Method::Post, "/nio");
    let mut link = UdpLink::new(NotificationBus::default());
    let pc1 = node(hosts.project, &hosts.a, "PC1", NodeType::Vpcs, &[(0, 4)]);
    let pc2 = node(hosts.project, &hosts.b, "PC2", NodeType::Vpcs, &[(3, 1)]);
    let pc2_nio = format!("{}/adapters/3/ports/1/nio", pc2.node_path());

    link.add_node(pc1, 0, 4).await.unwrap();
    assert!(matches!(
        link.add_node(pc2, 3, 1).await,
        Err(LinkError::Remote(RemoteError::Timeout(_)))
    ));
    let udp = format!("/projects/{}/ports/udp", hosts.project);
    assert_eq!(
        paths(&hosts.b.requests())[1..],
        [
            (Method::Post, pc2_nio.clone()),
            (Method::Delete, pc2_nio),
            (Method::Delete, format!("{}/2048", udp)),
        ]
    );
}

#[tokio::test]
async fn failed_allocation_hands_back_the_other_port() {
    let hosts = two_hosts();
    hosts.b.fail(Method::Post, "/ports/udp");
    let mut link = UdpLink::new(NotificationBus::default());
    let pc1 = node(hosts.project, &hosts.a, "PC1", NodeType::Vpcs, &[(0, 4)]);
    let pc2 = node(hosts.project, &hosts.b, "PC2", NodeType::Vpcs, &[(3, 1)]);

    link.add_node(pc1, 0, 4).await.unwrap();
    assert!(link.add_node(pc2, 3, 1).await.is_err());
    assert_eq!(link.state(), LinkState::OneEndpoint);
    let udp = format!("/projects/{}/ports/udp", hosts.project);
    assert_eq!(
        paths(&hosts.a.requests()),
        vec![(Method::Post, udp.clone()), (Method::Delete, format!("{}/1024", udp))]
    );
    assert_eq!(paths(&hosts.b.requests()), vec![(Method::Post, udp)]);
}

#[tokio::test]
async fn delete_unbinds_once() {
    let hosts = two_hosts();
    let mut link = established(&hosts).await;
    let endpoints = link.endpoints().to_vec();

    link.delete().await.unwrap();
    assert_eq!(link.state(), LinkState::Deleted);
    assert_eq!(
        paths(&hosts.a.requests()),
        vec![(Method::Delete, format!("{}/adapters/0/ports/4/nio", endpoints[0].node.node_path()))]
    );
    assert_eq!(
        paths(&hosts.b.requests()),
        vec![(Method::Delete, format!("{}/adapters/3/ports/1/nio", endpoints[1].node.node_path()))]
    );

    link.delete().await.unwrap();
    assert_eq!(hosts.a.requests().len(), 1);
    assert_eq!(hosts.b.requests().len(), 1);
}

#[tokio::test]
async fn update_filters_rebinds_both_sides() {
    let hosts = two_hosts();
    let mut link = established(&hosts).await;
    let filters = Filters::from([("delay".to_string(), vec![50, 10])]);
    link.update_filters(filters.clone()).await.unwrap();

    for (compute, lport) in [(&hosts.a, 1024), (&hosts.b, 2048)] {
        let requests = compute.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Put);
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["lport"], lport);
        assert_eq!(body["filters"], json!({"delay": [50, 10]}));
    }
    assert_eq!(link.nios()[0].filters(), &filters);
}

async fn capture_side(first: (&str, NodeType), second: (&str, NodeType)) -> String {
    let project = Id::random();
    let a = Arc::new(RecordingCompute::new(first.0).with_subnet("10.0.0.1", "10.0.0.2"));
    let b = Arc::new(RecordingCompute::new(second.0));
    let mut link = UdpLink::new(NotificationBus::default());
    link.add_node(node(project, &a, "first", first.1, &[(0, 0)]), 0, 0)
        .await
        .unwrap();
    link.add_node(node(project, &b, "second", second.1, &[(0, 0)]), 0, 0)
        .await
        .unwrap();
    link.choose_capture_side().unwrap().node.name().to_string()
}

#[tokio::test]
async fn capture_side_prefers_inline_capture() {
    assert_eq!(
        capture_side(("local", NodeType::Vpcs), ("remote", NodeType::Iou)).await,
        "second"
    );
    assert_eq!(
        capture_side(("remote", NodeType::Iou), ("local", NodeType::Vpcs)).await,
        "first"
    );
}

#[tokio::test]
async fn capture_side_prefers_local_compute() {
    assert_eq!(
        capture_side(("local", NodeType::Vpcs), ("remote", NodeType::Vpcs)).await,
        "first"
    );
    assert_eq!(
        capture_side(("remote", NodeType::Vpcs), ("local", NodeType::Vpcs)).await,
        "second"
    );
    // Nothing to choose between, the later endpoint wins
    assert_eq!(
        capture_side(("remote1", NodeType::Vpcs), ("remote2", NodeType::Vpcs)).await,
        "second"
    );
}

#[tokio::test]
async fn capture_lifecycle() {
    let hosts = two_hosts();
    let bus = NotificationBus::default();
    let mut queue = bus.queue();
    let mut link = UdpLink::new(bus);
    let pc1 = node(hosts.project, &hosts.a, "PC1", NodeType::Vpcs, &[(0, 4)]);
    let pc2 = node(hosts.project, &hosts.b, "PC2", NodeType::Vpcs, &[(3, 1)]);
    let pc2_port = format!("{}/adapters/3/ports/1", pc2.node_path());
    assert!(matches!(
        link.start_capture(DEFAULT_DATA_LINK_TYPE, None).await,
        Err(LinkError::NotEstablished(_))
    ));
    link.add_node(pc1, 0, 4).await.unwrap();
    link.add_node(pc2, 3, 1).await.unwrap();
    hosts.b.clear();

    link.start_capture(DEFAULT_DATA_LINK_TYPE, None).await.unwrap();
    assert!(link.capturing());
    assert_eq!(link.capture_file_name(), Some("PC1_0-4_to_PC2_3-1.pcap"));
    let requests = hosts.b.requests();
    assert_eq!(requests[0].path, format!("{}/start_capture", pc2_port));
    assert_eq!(
        requests[0].body,
        Some(json!({"capture_file_name": "PC1_0-4_to_PC2_3-1.pcap", "data_link_type": "DLT_EN10MB"}))
    );
    let update = queue.get(Duration::from_secs(1)).await.unwrap();
    assert_eq!(update.action, "link.updated");
    assert_eq!(update.event["capturing"], true);
    assert_eq!(update.event["capture_compute_id"], "remote2");

    assert!(matches!(
        link.start_capture(DEFAULT_DATA_LINK_TYPE, None).await,
        Err(LinkError::AlreadyCapturing(_))
    ));

    link.stop_capture().await.unwrap();
    assert!(!link.capturing());
    assert_eq!(
        paths(&hosts.b.requests()).last(),
        Some(&(Method::Post, format!("{}/stop_capture", pc2_port)))
    );
    let update = queue.get(Duration::from_secs(1)).await.unwrap();
    assert_eq!(update.event["capturing"], false);

    link.stop_capture().await.unwrap();
    link.start_capture("DLT_RAW", Some("mine.pcap")).await.unwrap();
    assert_eq!(link.capture_file_name(), Some("mine.pcap"));
}

#[tokio::test]
async fn reads_capture_from_its_side() {
    let hosts = two_hosts();
    let mut link = established(&hosts).await;
    assert!(matches!(
        link.read_pcap_from_source().await,
        Err(LinkError::NoCapture(_))
    ));

    hosts
        .b
        .add_file("tmp/captures/PC1_0-4_to_PC2_3-1.pcap", b"\xd4\xc3\xb2\xa1");
    link.start_capture(DEFAULT_DATA_LINK_TYPE, None).await.unwrap();
    link.stop_capture().await.unwrap();

    let chunks: Vec<Vec<u8>> = link
        .read_pcap_from_source()
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.concat(), b"\xd4\xc3\xb2\xa1");
    assert_eq!(
        hosts.b.streamed(),
        vec![(hosts.project, "tmp/captures/PC1_0-4_to_PC2_3-1.pcap".to_string())]
    );
}

#[tokio::test]
async fn capture_file_names_are_sanitized() {
    let project = Id::random();
    let a = Arc::new(RecordingCompute::new("local").with_subnet("10.0.0.1", "10.0.0.2"));
    let b = Arc::new(RecordingCompute::new("remote"));
    let mut link = UdpLink::new(NotificationBus::default());
    assert!(link.default_capture_file_name().is_err());
    link.add_node(node(project, &a, "R 1!", NodeType::Vpcs, &[(0, 0)]), 0, 0)
        .await
        .unwrap();
    link.add_node(node(project, &b, "../R2", NodeType::Vpcs, &[(1, 2)]), 1, 2)
        .await
        .unwrap();
    assert_eq!(
        link.default_capture_file_name().unwrap(),
        "R1_0-0_to_R2_1-2.pcap"
    );
}
