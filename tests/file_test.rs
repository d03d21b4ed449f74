use cluster_pipe::{AccessMode, ClusterError, ClusterFile, ClusterNode, Multiplexer, NodeRole, Session};
use test_utils::{bounded_cluster, local_cluster, pattern, temp_file, temp_path};

async fn read_chunks(file: &mut ClusterFile<ClusterNode>, size: usize) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut buf = vec![0; size];
    loop {
        let n = file.read(&mut buf).await.unwrap();
        if n == 0 {
            return chunks;
        }
        chunks.push(buf[..n].to_vec());
    }
}

#[tokio::test]
async fn test_reads_replicated_to_every_slave() {
    let cluster = local_cluster(2, 4096);
    let contents = pattern(10_000);
    let path = temp_file(&contents);

    let mut slaves = Vec::new();
    for slave in cluster.slaves.clone() {
        let path = path.clone();
        slaves.push(tokio::spawn(async move {
            let mut file = slave.open_file(&path, AccessMode::ReadOnly).await.unwrap();
            assert_eq!(file.role(), NodeRole::Slave);
            let size = file.get_size().await.unwrap();
            let chunks = read_chunks(&mut file, 4096).await;
            file.close().await.unwrap();
            (size, chunks)
        }));
    }

    let mut file = cluster.master.open_file(&path, AccessMode::ReadOnly).await.unwrap();
    assert_eq!(file.get_size().await.unwrap(), 10_000);
    let chunks = read_chunks(&mut file, 4096).await;
    let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
    assert_eq!(sizes, [4096, 4096, 1808]);
    assert_eq!(chunks.concat(), contents);
    file.close().await.unwrap();

    for slave in slaves {
        let (size, slave_chunks) = slave.await.unwrap();
        assert_eq!(size, 10_000);
        assert_eq!(slave_chunks, chunks);
    }
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_small_reads_and_read_to_end() {
    let cluster = local_cluster(1, 64);
    let contents = pattern(500);
    let path = temp_file(&contents);

    async fn consume(session: Session<ClusterNode>, path: std::path::PathBuf) -> Vec<u8> {
        let mut file = session.open_file(&path, AccessMode::ReadOnly).await.unwrap();
        let mut head = [0u8; 10];
        file.read_exact(&mut head).await.unwrap();
        let mut out = head.to_vec();
        file.read_to_end(&mut out).await.unwrap();
        assert!(matches!(
            file.read_exact(&mut head).await,
            Err(ClusterError::UnexpectedEof)
        ));
        out
    }

    let slave = tokio::spawn(consume(cluster.slaves[0].clone(), path.clone()));
    assert_eq!(consume(cluster.master.clone(), path.clone()).await, contents);
    assert_eq!(slave.await.unwrap(), contents);
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_seek_discards_buffer_everywhere() {
    let cluster = local_cluster(1, 4);
    let path = temp_file(b"0123456789");

    async fn run(session: Session<ClusterNode>, path: std::path::PathBuf) -> Vec<u8> {
        let mut file = session.open_file(&path, AccessMode::ReadOnly).await.unwrap();
        let mut buf = [0u8; 3];
        file.read_exact(&mut buf).await.unwrap();
        let mut seen = buf.to_vec();
        file.seek(6).await.unwrap();
        let mut rest = Vec::new();
        file.read_to_end(&mut rest).await.unwrap();
        seen.extend_from_slice(&rest);
        seen
    }

    let slave = tokio::spawn(run(cluster.slaves[0].clone(), path.clone()));
    assert_eq!(run(cluster.master.clone(), path.clone()).await, b"0126789");
    assert_eq!(slave.await.unwrap(), b"0126789");
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_open_failure_reaches_slaves() {
    let cluster = local_cluster(2, 64);
    let missing = temp_path();

    let result = cluster.master.open_file(&missing, AccessMode::ReadOnly).await;
    assert!(matches!(result, Err(ClusterError::Io(_))));

    for slave in &cluster.slaves {
        let result = slave.open_file(&missing, AccessMode::ReadOnly).await;
        assert!(matches!(result, Err(ClusterError::RemoteFault { .. })));
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_master_read_failure_reaches_slaves() {
    let cluster = local_cluster(1, 64);
    // Opening a directory succeeds on Linux, reading it does not.
    let dir = std::env::temp_dir();

    let mut file = cluster.master.open_file(&dir, AccessMode::ReadOnly).await.unwrap();
    let mut slave = cluster.slaves[0].open_file(&dir, AccessMode::ReadOnly).await.unwrap();

    let mut buf = [0u8; 16];
    assert!(matches!(file.read(&mut buf).await, Err(ClusterError::Io(_))));
    assert!(matches!(slave.read(&mut buf).await, Err(ClusterError::RemoteFault { .. })));
}

#[tokio::test]
async fn test_writes_stay_on_master() {
    let cluster = local_cluster(1, 64);
    let path = temp_path();

    let mut file = cluster.master.open_file(&path, AccessMode::WriteOnly).await.unwrap();
    let mut slave = cluster.slaves[0].open_file(&path, AccessMode::WriteOnly).await.unwrap();

    assert_eq!(file.write(b"written once").await.unwrap(), 12);
    assert_eq!(slave.write(b"written once").await.unwrap(), 12);

    let mut buf = [0u8; 4];
    let denied = slave.read(&mut buf).await;
    assert!(matches!(denied, Err(ClusterError::AccessDenied { operation: "read", .. })));
    assert!(denied.unwrap_err().is_contract_violation());
    assert!(matches!(file.read(&mut buf).await, Err(ClusterError::AccessDenied { .. })));

    file.close().await.unwrap();
    slave.close().await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"written once");
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_only_master_has_a_file() {
    let cluster = local_cluster(1, 64);
    let path = temp_file(b"x");

    let mut file = cluster.master.open_file(&path, AccessMode::ReadOnly).await.unwrap();
    let mut slave = cluster.slaves[0].open_file(&path, AccessMode::ReadOnly).await.unwrap();

    assert!(file.file().is_ok());
    assert!(matches!(
        slave.file(),
        Err(ClusterError::RoleViolation {
            role: NodeRole::Slave,
            ..
        })
    ));
    #[cfg(unix)]
    {
        assert!(file.raw_fd().is_ok());
        assert!(slave.raw_fd().is_err());
    }

    assert_eq!(file.set_buffer_size(1 << 20), 64);
    assert_eq!(slave.set_buffer_size(16), 64);
    assert_eq!(slave.buffer_size(), 64);
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_reads_fit_one_packet_per_node() {
    let cluster = bounded_cluster(1, 64, Some(1));
    let contents = pattern(200);
    let path = temp_file(&contents);

    async fn consume(session: Session<ClusterNode>, path: std::path::PathBuf) -> (u64, Vec<u8>) {
        let mut file = session.open_file(&path, AccessMode::ReadOnly).await.unwrap();
        let size = file.get_size().await.unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.unwrap();
        file.close().await.unwrap();
        (size, out)
    }

    let slave = tokio::spawn(consume(cluster.slaves[0].clone(), path.clone()));
    assert_eq!(consume(cluster.master.clone(), path.clone()).await, (200, contents.clone()));
    assert_eq!(slave.await.unwrap(), (200, contents));
    assert_eq!(cluster.master.multiplexer().packet_pool().outstanding(), 0);
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_pool_exhaustion_reaches_slaves() {
    let cluster = bounded_cluster(1, 64, Some(1));
    let path = temp_file(&pattern(200));

    let mut file = cluster.master.open_file(&path, AccessMode::ReadOnly).await.unwrap();
    let mut slave = cluster.slaves[0].open_file(&path, AccessMode::ReadOnly).await.unwrap();

    let held = cluster.master.multiplexer().new_packet().unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(file.read(&mut buf).await, Err(ClusterError::PoolExhausted(1))));
    assert!(matches!(slave.read(&mut buf).await, Err(ClusterError::RemoteFault { .. })));
    drop(held);
    std::fs::remove_file(path).unwrap();
}

#[tokio::test]
async fn test_write_lands_at_read_position() {
    let cluster = local_cluster(1, 4);
    let path = temp_file(b"0123456789");

    async fn run(session: Session<ClusterNode>, path: std::path::PathBuf) -> Vec<u8> {
        let mut file = session.open_file(&path, AccessMode::ReadWrite).await.unwrap();
        let mut head = [0u8; 2];
        file.read_exact(&mut head).await.unwrap();
        assert_eq!(file.write(b"XY").await.unwrap(), 2);
        let mut seen = head.to_vec();
        file.read_to_end(&mut seen).await.unwrap();
        file.close().await.unwrap();
        seen
    }

    let slave = tokio::spawn(run(cluster.slaves[0].clone(), path.clone()));
    assert_eq!(run(cluster.master.clone(), path.clone()).await, b"01456789");
    assert_eq!(slave.await.unwrap(), b"01456789");
    assert_eq!(std::fs::read(&path).unwrap(), b"01XY456789");
    std::fs::remove_file(path).unwrap();
}
