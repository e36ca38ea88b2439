//! Result CSV writers.
//!
//! Two traces per run: `cluster_<key>.csv` (periodic cluster metrics) and
//! `requests_<key>.csv` (per-request records, sorted by flow id). The key
//! encodes the DAG dimensions and the duplicated-execution policy.

use std::path::Path;

use tracing::info;

use faasim_common::config::PolicyConfig;
use faasim_common::error::OutputError;
use faasim_engine::cluster::Cluster;
use faasim_engine::records::RequestRecord;

/// File-name key shared by both result traces.
pub fn result_key(width: usize, depth: usize, invocations: usize, policy: &PolicyConfig) -> String {
    format!(
        "w-{width}_d-{depth}_n-{invocations}_dup-{}_r-{}",
        policy.dup_execution as u8, policy.dup_execution_threshold
    )
}

/// Write both result traces under `outdir`.
pub fn dump(cluster: &Cluster, outdir: &Path, key: &str) -> Result<(), OutputError> {
    std::fs::create_dir_all(outdir).map_err(|source| OutputError::Io {
        path: outdir.to_path_buf(),
        source,
    })?;

    let cluster_path = outdir.join(format!("cluster_{key}.csv"));
    let mut writer = csv::Writer::from_path(&cluster_path)?;
    for record in &cluster.trace {
        writer.serialize(record)?;
    }
    writer.flush().map_err(|source| OutputError::Io {
        path: cluster_path.clone(),
        source,
    })?;

    let requests_path = outdir.join(format!("requests_{key}.csv"));
    let mut rows: Vec<&RequestRecord> = cluster.sink.iter().collect();
    rows.sort_by_key(|r| r.flow_id);
    let mut writer = csv::Writer::from_path(&requests_path)?;
    for record in rows {
        writer.serialize(record)?;
    }
    writer.flush().map_err(|source| OutputError::Io {
        path: requests_path.clone(),
        source,
    })?;

    info!(
        cluster_trace = %cluster_path.display(),
        requests_trace = %requests_path.display(),
        rows = cluster.sink.len(),
        "results written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use faasim_common::config::SimConfig;
    use faasim_engine::function::{Function, Request};
    use std::collections::BTreeMap;

    #[test]
    fn result_key_encodes_policy() {
        let mut policy = PolicyConfig::default();
        assert_eq!(result_key(3, 3, 1000, &policy), "w-3_d-3_n-1000_dup-0_r-0.5");
        policy.dup_execution = true;
        policy.dup_execution_threshold = 0.75;
        assert_eq!(result_key(1, 8, 512, &policy), "w-1_d-8_n-512_dup-1_r-0.75");
    }

    #[test]
    fn dump_writes_sorted_requests() {
        let cfg = SimConfig::default();
        let mut cluster =
            Cluster::with_seed(cfg, vec![Function::new("func-0", 1)], BTreeMap::new(), 42);
        cluster.add_node("worker-0", 16, 64 * 1024);

        // Drive two requests to completion in reverse flow order.
        for flow_id in [1u64, 0] {
            let now = cluster.now();
            cluster.ingress_accept(Request::new(
                flow_id, "", "func-0", 100, 170, now, 1.0, 900_000,
            ));
            for _ in 0..6_000 {
                cluster.tick();
                cluster.advance(1);
            }
        }
        assert_eq!(cluster.sink.len(), 2);

        let dir = tempfile::tempdir().unwrap();
        let key = "w-1_d-1_n-2_dup-0_r-0.5";
        dump(&cluster, dir.path(), key).unwrap();

        let requests = std::fs::read_to_string(dir.path().join(format!("requests_{key}.csv"))).unwrap();
        let mut lines = requests.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("req_id,flow_id,dag,node,host,rps,arrival_time"));
        // Sorted by flow id regardless of completion order.
        assert!(lines.next().unwrap().starts_with("0-func-0,0"));
        assert!(lines.next().unwrap().starts_with("1-func-0,1"));

        let cluster_csv = std::fs::read_to_string(dir.path().join(format!("cluster_{key}.csv"))).unwrap();
        assert!(cluster_csv.starts_with("rps,timestamp,actual_scale,desired_scale"));
    }
}
