//! YAML dump and load of aggregated groups

use crate::aggregator::HttpStat;
use crate::error::StatsResult;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

pub fn dump<W: Write>(writer: W, stats: &[HttpStat]) -> StatsResult<()> {
    serde_yaml::to_writer(writer, stats)?;
    Ok(())
}

pub fn load<R: Read>(reader: R) -> StatsResult<Vec<HttpStat>> {
    Ok(serde_yaml::from_reader(reader)?)
}

pub fn dump_file(path: &Path, stats: &[HttpStat]) -> StatsResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    dump(&mut writer, stats)?;
    writer.flush()?;
    info!("Dumped {} groups to {}", stats.len(), path.display());
    Ok(())
}

pub fn load_file(path: &Path) -> StatsResult<Vec<HttpStat>> {
    let stats = load(BufReader::new(File::open(path)?))?;
    info!("Loaded {} groups from {}", stats.len(), path.display());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, StatsOptions};
    use crate::error::StatsError;
    use logprof_core::Record;

    fn stats() -> Vec<HttpStat> {
        let options = StatsOptions {
            request_body_percentile: false,
            ..Default::default()
        };
        let mut agg = Aggregator::new(options).unwrap();
        agg.set(&Record::new("/a", "GET", 200, 0.125, 10.0).with_time("t1"))
            .unwrap();
        agg.set(&Record::new("/a", "GET", 503, 0.5, 0.0)).unwrap();
        agg.set(&Record::new("/b?x=1", "POST", 201, 1.0, 2.0)).unwrap();
        agg.into_stats()
    }

    #[test]
    fn test_field_names() {
        let mut out = Vec::new();
        dump(&mut out, &stats()).unwrap();
        let text = String::from_utf8(out).unwrap();
        for field in [
            "uri:",
            "count:",
            "status1xx:",
            "status5xx:",
            "method:",
            "response_time:",
            "request_body_bytes:",
            "response_body_bytes:",
            "usepercentile:",
            "percentiles:",
            "time:",
        ] {
            assert!(text.contains(field), "missing {field} in\n{text}");
        }
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.yaml");
        let original = stats();
        dump_file(&path, &original).unwrap();
        assert_eq!(load_file(&path).unwrap(), original);
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            load("- uri: [".as_bytes()),
            Err(StatsError::Snapshot(_))
        ));
        assert!(matches!(
            load_file(Path::new("/nonexistent/dump.yaml")),
            Err(StatsError::Io(_))
        ));
    }
}
