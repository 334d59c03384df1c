use futures::TryStreamExt;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use vnet::{
    config::{EndpointConfig, LinkConfig, NodeConfig, Topology},
    link::DEFAULT_DATA_LINK_TYPE,
    node::Node,
    project::Project,
};
use vnet_core::{
    compute::{ChannelCompute, Interface, RemoteError},
    host::{ComputeHost, HostSettings},
    node::{NodeStatus, NodeType},
    notification::NotificationBus,
    port_manager::PortManager,
    supervisor::SupervisorSettings,
    testing::{FakeBridgeFactory, FakeLauncher},
    ComputeHandle, Id,
};

struct Host {
    compute: Arc<dyn ComputeHandle>,
    bridges: FakeBridgeFactory,
    launcher: FakeLauncher,
    bus: NotificationBus,
    projects_dir: PathBuf,
    ports: Arc<PortManager>,
    task: tokio::task::JoinHandle<()>,
}

fn boot(id: &str, ip: &str, udp: std::ops::RangeInclusive<u16>, cancel: &CancellationToken) -> Host {
    let launcher = FakeLauncher::new();
    launcher.set_output("vpcs", "Welcome to Virtual PC Simulator, version 0.6.1");
    let bridges = FakeBridgeFactory::new();
    let bus = NotificationBus::default();
    let projects_dir = std::env::temp_dir().join(format!("vnet-e2e-{}", Id::random()));
    let settings = HostSettings {
        host: ip.into(),
        interfaces: vec![Interface {
            name: "eth0".into(),
            ip_address: ip.into(),
            netmask: Some("255.255.255.0".into()),
        }],
        projects_dir: projects_dir.clone(),
        supervisor: SupervisorSettings {
            startup_grace: Duration::ZERO,
            ..Default::default()
        },
    };
    // Ports are probed on loopback, whatever the advertised address
    let ports = Arc::new(PortManager::new("127.0.0.1", udp, 48000..=48999));
    let host = Arc::new(ComputeHost::new(
        settings,
        ports.clone(),
        Arc::new(launcher.clone()),
        Arc::new(bridges.clone()),
        bus.clone(),
    ));
    let (compute, task): (ChannelCompute, _) =
        host.serve(id, Duration::from_secs(5), cancel.child_token());
    Host {
        compute: Arc::new(compute),
        bridges,
        launcher,
        bus,
        projects_dir,
        ports,
        task,
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn link_two_hosts() {
    let cancel = CancellationToken::new();
    let local = boot("local", "192.168.7.1", 43000..=43499, &cancel);
    let remote = boot("remote", "192.168.7.2", 43500..=43999, &cancel);
    let mut events = local.bus.queue();
    let project = Id::random();

    let pc1 = Node::create(project, local.compute.clone(), "PC1", NodeType::Vpcs)
        .await
        .unwrap();
    let pc2 = Node::create(project, remote.compute.clone(), "PC2", NodeType::Vpcs)
        .await
        .unwrap();
    assert!(pc1.port(0, 0).is_some());

    let mut link = vnet::link::UdpLink::new(NotificationBus::default());
    link.add_node(pc1.clone(), 0, 0).await.unwrap();
    link.add_node(pc2.clone(), 0, 0).await.unwrap();
    let (local_nio, remote_nio) = (link.nios()[0].clone(), link.nios()[1].clone());
    let vnet_core::nio::Nio::Udp(local_udp) = &local_nio;
    let vnet_core::nio::Nio::Udp(remote_udp) = &remote_nio;
    assert_eq!(local_udp.rhost, "192.168.7.2");
    assert_eq!(remote_udp.rhost, "192.168.7.1");
    assert_eq!(local_udp.rport, remote_udp.lport);
    assert!((43000..=43499).contains(&local_udp.lport));
    assert!((43500..=43999).contains(&remote_udp.lport));

    let snapshot = pc1.start().await.unwrap();
    assert_eq!(snapshot.status, NodeStatus::Started);
    let event = events.get(Duration::from_secs(1)).await.unwrap();
    assert_eq!(event.action, "node.updated");
    assert_eq!(event.event["node_id"], pc1.id().to_string());

    let bridge = local.bridges.bridge(pc1.id()).unwrap();
    let forwarded = format!(
        "bridge add_nio_udp {}-0-0 {} 192.168.7.2 {}",
        pc1.id(),
        local_udp.lport,
        local_udp.rport
    );
    assert!(bridge.commands().contains(&forwarded), "{:?}", bridge.commands());

    // Both vpcs, so the endpoint on the local compute records
    link.start_capture(DEFAULT_DATA_LINK_TYPE, None).await.unwrap();
    let file = link.capture_file_name().unwrap().to_string();
    assert_eq!(file, "PC1_0-0_to_PC2_0-0.pcap");
    assert!(bridge
        .commands()
        .iter()
        .any(|command| command.starts_with(&format!("bridge start_capture {}-0-0", pc1.id()))));
    let captures = local
        .projects_dir
        .join(project.to_string())
        .join("tmp")
        .join("captures");
    tokio::fs::write(captures.join(&file), b"captured").await.unwrap();
    link.stop_capture().await.unwrap();
    let bytes: Vec<Vec<u8>> = link
        .read_pcap_from_source()
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(bytes.concat(), b"captured");

    link.delete().await.unwrap();
    assert!(bridge
        .commands()
        .contains(&format!("bridge delete {}-0-0", pc1.id())));
    pc1.stop().await.unwrap();
    pc1.delete().await.unwrap();
    pc2.delete().await.unwrap();
    assert!(matches!(
        pc1.snapshot().await,
        Err(RemoteError::Status { status: 404, .. })
    ));

    cancel.cancel();
    local.task.await.unwrap();
    remote.task.await.unwrap();
    assert_eq!(local.launcher.spawned().len(), 1);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn failed_link_leaves_nothing_behind() {
    let cancel = CancellationToken::new();
    let local = boot("local", "192.168.9.1", 40000..=40003, &cancel);
    let remote = boot("remote", "192.168.9.2", 40500..=40503, &cancel);
    let project = Id::random();
    let pc1 = Node::create(project, local.compute.clone(), "PC1", NodeType::Vpcs)
        .await
        .unwrap();
    let pc2 = Node::create(project, remote.compute.clone(), "PC2", NodeType::Vpcs)
        .await
        .unwrap();
    pc2.start().await.unwrap();
    let bridge = remote.bridges.bridge(pc2.id()).unwrap();
    bridge.reject(Some("bridge add_nio_udp"));

    // Only the tunnels of the running node hold ports
    let held = |ports: &PortManager, range: std::ops::RangeInclusive<u16>| {
        range.filter(|port| ports.udp_port_in_use(*port)).count()
    };
    let remote_held = held(&remote.ports, 40500..=40503);

    for _ in 0..3 {
        let mut link = vnet::link::UdpLink::new(NotificationBus::default());
        link.add_node(pc1.clone(), 0, 0).await.unwrap();
        assert!(matches!(
            link.add_node(pc2.clone(), 0, 0).await,
            Err(vnet::link::LinkError::Remote(RemoteError::Status { status: 409, .. }))
        ));
        assert_eq!(held(&local.ports, 40000..=40003), 0);
        assert_eq!(held(&remote.ports, 40500..=40503), remote_held);
    }
    let snapshot = pc2.snapshot().await.unwrap();
    assert_eq!(snapshot.status, NodeStatus::Started);

    bridge.reject(None);
    let mut link = vnet::link::UdpLink::new(NotificationBus::default());
    link.add_node(pc1.clone(), 0, 0).await.unwrap();
    link.add_node(pc2.clone(), 0, 0).await.unwrap();
    assert_eq!(link.state(), vnet::link::LinkState::Established);

    cancel.cancel();
    local.task.await.unwrap();
    remote.task.await.unwrap();
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn project_brings_up_topology() {
    let cancel = CancellationToken::new();
    let host = boot("local", "127.0.0.1", 44000..=44999, &cancel);
    let topology = Topology {
        nodes: vec![
            NodeConfig {
                name: "PC1".into(),
                node_type: NodeType::Vpcs,
            },
            NodeConfig {
                name: "TR1".into(),
                node_type: NodeType::TraceNg,
            },
        ],
        links: vec![LinkConfig {
            a: EndpointConfig {
                node: "PC1".into(),
                adapter: 0,
                port: 0,
            },
            b: EndpointConfig {
                node: "TR1".into(),
                adapter: 0,
                port: 0,
            },
            filters: Default::default(),
        }],
    };
    let mut project = Project::build(host.compute.clone(), &topology, NotificationBus::default())
        .await
        .unwrap();
    assert_eq!(project.nodes().len(), 2);
    assert_eq!(project.links().len(), 1);
    project.start_all().await.unwrap();
    for node in project.nodes() {
        assert_eq!(node.snapshot().await.unwrap().status, NodeStatus::Started);
    }
    let spawned = host.launcher.spawned();
    assert_eq!(spawned.len(), 2);
    assert!(spawned.iter().any(|argv| argv[0] == "traceng"));

    project.close().await;
    assert!(project.nodes().is_empty());
    assert!(host.launcher.last_process().unwrap().has_exited());

    cancel.cancel();
    host.task.await.unwrap();
}

#[tokio::test]
async fn unreachable_after_shutdown() {
    let cancel = CancellationToken::new();
    let host = boot("local", "127.0.0.1", 45000..=45499, &cancel);
    cancel.cancel();
    host.task.await.unwrap();
    assert!(matches!(
        Node::create(Id::random(), host.compute.clone(), "PC1", NodeType::Vpcs).await,
        Err(RemoteError::Unreachable(_))
    ));
}
