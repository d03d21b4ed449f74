use cluster_pipe::{ClusterError, GatherOp, LocalCluster, NodeRole};
use test_utils::local_cluster;

#[tokio::test]
async fn test_slave_cannot_write() {
    let cluster = local_cluster(1, 32);
    let mut pipe = cluster.slaves[0].open_pipe().unwrap();

    let result = pipe.write_raw(b"nope");
    assert!(matches!(
        result,
        Err(ClusterError::RoleViolation {
            operation: "write_raw",
            role: NodeRole::Slave
        })
    ));
    assert!(result.unwrap_err().is_contract_violation());

    assert!(matches!(pipe.finish_message(), Err(ClusterError::RoleViolation { .. })));
    assert!(matches!(pipe.write_chunk(b"x"), Err(ClusterError::RoleViolation { .. })));
    assert!(matches!(pipe.abort("x"), Err(ClusterError::RoleViolation { .. })));
    assert!(matches!(pipe.write(1u8), Err(ClusterError::RoleViolation { .. })));
}

#[tokio::test]
async fn test_master_cannot_read() {
    let cluster = local_cluster(1, 32);
    let mut pipe = cluster.master.open_pipe().unwrap();

    let mut buf = [0xaa; 8];
    let result = pipe.read_raw(&mut buf).await;
    assert!(matches!(
        result,
        Err(ClusterError::RoleViolation {
            operation: "read_raw",
            role: NodeRole::Master
        })
    ));
    assert_eq!(buf, [0xaa; 8]);

    assert!(matches!(pipe.read_chunk().await, Err(ClusterError::RoleViolation { .. })));
}

#[tokio::test]
async fn test_abort_reaches_slaves_after_pending_data() {
    let cluster = local_cluster(2, 32);

    let mut master = cluster.master.open_pipe().unwrap();
    master.write_raw(b"before the fault").unwrap();
    master.abort("source went away").unwrap();

    for slave in &cluster.slaves {
        let mut pipe = slave.open_pipe().unwrap();
        let mut buf = [0u8; 16];
        pipe.read_raw(&mut buf).await.unwrap();
        assert_eq!(&buf, b"before the fault");

        for _ in 0..2 {
            match pipe.read::<u32>().await {
                Err(ClusterError::RemoteFault { reason, .. }) => assert_eq!(reason, "source went away"),
                other => panic!("expected remote fault, got {other:?}"),
            }
        }
    }
}

#[tokio::test]
async fn test_master_departure_disconnects_slaves() {
    let LocalCluster { master, slaves } = local_cluster(1, 32);

    let mut pipe = master.open_pipe().unwrap();
    pipe.write_raw(b"last words").unwrap();
    drop(pipe);
    drop(master);

    let mut slave = slaves[0].open_pipe().unwrap();
    let mut buf = [0u8; 10];
    slave.read_raw(&mut buf).await.unwrap();
    assert_eq!(&buf, b"last words");

    assert!(matches!(slave.read::<u8>().await, Err(ClusterError::Disconnected)));
    assert!(matches!(slave.barrier().await, Err(ClusterError::Disconnected)));
}

#[tokio::test]
async fn test_slave_departure_fails_master_collectives() {
    let LocalCluster { master, slaves } = local_cluster(1, 32);
    drop(slaves);

    let mut pipe = master.open_pipe().unwrap();
    assert!(matches!(
        pipe.gather(1, GatherOp::Sum).await,
        Err(ClusterError::Disconnected)
    ));
}

#[tokio::test]
async fn test_chunk_read_refuses_partial_packet() {
    let cluster = local_cluster(1, 32);

    let mut master = cluster.master.open_pipe().unwrap();
    master.write_raw(b"abcdef").unwrap();
    master.finish_message().unwrap();

    let mut pipe = cluster.slaves[0].open_pipe().unwrap();
    let mut buf = [0u8; 2];
    pipe.read_raw(&mut buf).await.unwrap();
    assert!(matches!(pipe.read_chunk().await, Err(ClusterError::Protocol(_))));
}

#[tokio::test]
async fn test_oversized_chunk_rejected() {
    let cluster = local_cluster(1, 8);
    let mut master = cluster.master.open_pipe().unwrap();
    assert!(matches!(
        master.write_chunk(&[0; 9]),
        Err(ClusterError::PacketOverflow { len: 9, capacity: 8 })
    ));
}

#[tokio::test]
async fn test_mismatched_collective_fails_every_node() {
    let LocalCluster { master, slaves } = local_cluster(2, 32);

    let mut tasks = Vec::new();
    for (slave, op) in slaves.into_iter().zip([GatherOp::Sum, GatherOp::Max]) {
        tasks.push(tokio::spawn(async move {
            let mut pipe = slave.open_pipe().unwrap();
            let gathered = pipe.gather(1, op).await;
            let released = pipe.barrier().await;
            (gathered, released)
        }));
    }

    let mut pipe = master.open_pipe().unwrap();
    match pipe.gather(1, GatherOp::Sum).await {
        Err(ClusterError::Protocol(reason)) => assert!(reason.contains("Max"), "{reason}"),
        other => panic!("expected protocol error, got {other:?}"),
    }
    // Every contribution was consumed, so the channel stays usable.
    pipe.barrier().await.unwrap();

    for task in tasks {
        let (gathered, released) = task.await.unwrap();
        assert!(matches!(gathered, Err(ClusterError::RemoteFault { .. })));
        released.unwrap();
    }
}

#[tokio::test]
async fn test_oversized_string_length_rejected() {
    let cluster = local_cluster(1, 32);
    let mut master = cluster.master.open_pipe().unwrap();
    master.write(u32::MAX).unwrap();
    master.finish_message().unwrap();

    let mut pipe = cluster.slaves[0].open_pipe().unwrap();
    assert!(matches!(pipe.read_string().await, Err(ClusterError::Protocol(_))));
}
