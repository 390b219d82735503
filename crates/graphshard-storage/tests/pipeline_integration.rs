//! End-to-end tests of the sharding pipeline against in-memory shards.
//!
//! The dataset is three people where A knows B and B knows C, plus one
//! person with no relationships. A fixed partitioner puts A and B on shard 0
//! and C on shard 1.

use graphshard_core::{EntityType, PropertyValue, RelationType, Vid};
use graphshard_storage::config::{GraphshardConfig, StoreBackend};
use graphshard_storage::dataset::DatasetError;
use graphshard_storage::sharding::{
    CrossShardLedger, MetisPartitioner, PartitionError, Partitioner, Result as PartitionResult,
    ShardAssignment, UnroutableLog, ASSIGNMENT_FILE, UNROUTABLE_FILE,
};
use graphshard_storage::{MemoryShardStore, Pipeline, PipelineError, ShardLoader};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const PERSONS: &str = "\
id|firstName|lastName|gender|birthday|creationDate|locationIP|browserUsed
100|Ada|A|female|1990-01-01|2010-01-01T10:00:00.000+0000|1.1.1.1|Firefox
200|Bob|B|male|1991-02-02|2010-02-02T10:00:00.000+0000|2.2.2.2|Chrome
300|Cy|C|male|1992-03-03|2010-03-03T10:00:00.000+0000|3.3.3.3|Safari
400|Dee|D|female||2010-04-04T10:00:00.000+0000||
xx|Bad|Id|male|1990-01-01|2010-01-01T10:00:00.000+0000|0.0.0.0|Lynx
";

const KNOWS: &str = "\
Person.id|Person.id|creationDate
100|200|2011-01-01T00:00:00.000+0000
200|300|2012-01-01T00:00:00.000+0000
100|999|2013-01-01T00:00:00.000+0000
";

/// Writes a partition file with fixed shards, one per line.
struct FixedPartitioner(Vec<u32>);

impl Partitioner for FixedPartitioner {
    fn partition(&self, graph_file: &Path, shard_count: u32) -> PartitionResult<PathBuf> {
        if !graph_file.is_file() {
            return Err(PartitionError::MissingInput {
                what: "partition graph",
                path: graph_file.to_path_buf(),
            });
        }
        let output = MetisPartitioner::output_path(graph_file, shard_count);
        let lines: String = self.0.iter().map(|sid| format!("{sid}\n")).collect();
        fs::write(&output, lines)?;
        Ok(output)
    }

    fn describe(&self) -> String {
        "FixedPartitioner".to_string()
    }
}

struct Fixture {
    dir: TempDir,
    config: GraphshardConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("social_network");
        fs::create_dir_all(root.join("static")).unwrap();
        fs::create_dir_all(root.join("dynamic")).unwrap();
        fs::write(root.join("dynamic").join("person_0_0.csv"), PERSONS).unwrap();
        fs::write(root.join("dynamic").join("person_knows_person_0_0.csv"), KNOWS).unwrap();

        let mut config = GraphshardConfig::default();
        config.dataset.root = root.to_string_lossy().into_owned();
        config.dataset.entities = vec![EntityType::Person];
        config.dataset.relations = vec![RelationType::PersonKnowsPerson];
        config.state.dir = dir.path().join("state").to_string_lossy().into_owned();
        config.state.graph_dir = dir.path().join("graph").to_string_lossy().into_owned();
        config.partition.shard_count = 2;
        config.partition.relations = vec![RelationType::PersonKnowsPerson];
        config.loader.backend = StoreBackend::Memory;
        config.loader.batch_size = 2;
        config.loader.retry_backoff_ms = 0;

        Self { dir, config }
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.config.clone()).unwrap()
    }

    fn loader(&self) -> ShardLoader<MemoryShardStore> {
        let stores = (0..2).map(MemoryShardStore::new).collect();
        ShardLoader::new(stores, self.config.loader.clone()).unwrap()
    }

    fn state(&self) -> PathBuf {
        self.dir.path().join("state")
    }
}

#[test]
fn test_full_run_places_nodes_and_edges() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();
    let mut loader = fixture.loader();

    let report = pipeline
        .run(&FixedPartitioner(vec![0, 0, 1]), &mut loader)
        .unwrap();

    // vids follow file order; the malformed id is skipped
    assert_eq!(report.identity.assigned, 4);
    assert_eq!(report.identity.unparseable, 1);

    // 400 has no relationship and 999 is unknown
    assert_eq!(report.graph.nodes, 3);
    assert_eq!(report.graph.edges, 2);
    assert_eq!(report.graph.isolated_vids, 1);
    assert_eq!(report.resolve.resolved, 3);

    let stores = loader.into_stores();
    let (shard0, shard1) = (&stores[0], &stores[1]);

    assert!(shard0.node(EntityType::Person, Vid(1)).is_some());
    assert!(shard0.node(EntityType::Person, Vid(2)).is_some());
    assert!(shard1.node(EntityType::Person, Vid(3)).is_some());
    assert_eq!(shard0.node_count(), 2);
    assert_eq!(shard1.node_count(), 1);
    assert!(shard0.has_proxy_node() && shard1.has_proxy_node());

    let person = shard0.node(EntityType::Person, Vid(1)).unwrap();
    assert_eq!(person["firstName"], PropertyValue::String("Ada".into()));
    assert_eq!(person["birthday"], PropertyValue::Date("1990-01-01".into()));

    // A knows B stays local to shard 0
    let local = shard0
        .edge(RelationType::PersonKnowsPerson, Vid(1), Vid(2))
        .unwrap();
    assert!(!local.contains_key("proxy"));

    // B knows C is written once, on B's shard, as a proxy edge
    let proxy = shard0
        .proxy_edge(RelationType::PersonKnowsPerson, Vid(2), Vid(3))
        .unwrap();
    assert_eq!(proxy["proxy"], PropertyValue::Bool(true));
    assert_eq!(proxy["target_vid"], PropertyValue::Int(3));
    assert_eq!(proxy["target_sid"], PropertyValue::Int(1));
    assert_eq!(
        proxy["creationDate"],
        PropertyValue::DateTime("2012-01-01T00:00:00.000+0000".into())
    );
    assert_eq!(shard0.edge_count(), 2);
    assert_eq!(shard1.edge_count(), 0);

    assert_eq!(report.relationships.direct_edges, 1);
    assert_eq!(report.relationships.proxy_edges, 1);
    assert_eq!(report.relationships.unresolved, 1);
}

#[test]
fn test_side_tables_are_persisted() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();
    let mut loader = fixture.loader();
    pipeline
        .run(&FixedPartitioner(vec![0, 0, 1]), &mut loader)
        .unwrap();

    let (assignment, invalid) =
        ShardAssignment::load(&fixture.state().join(ASSIGNMENT_FILE), 2).unwrap();
    assert_eq!(invalid, 0);
    assert_eq!(assignment.get(Vid(3)), Some(1));
    assert_eq!(assignment.get(Vid(4)), None);

    let ledger = CrossShardLedger::load(&fixture.state(), RelationType::PersonKnowsPerson).unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.get(Vid(2), Vid(3)).unwrap().to_sid, 1);

    // the isolated person never received a shard
    let unroutable = UnroutableLog::load(&fixture.state()).unwrap();
    assert!(unroutable.contains(Vid(4)));
    assert_eq!(unroutable.len(), 1);

    let vid_map = fs::read_to_string(fixture.state().join("person_vid_map.csv")).unwrap();
    assert_eq!(vid_map, "original_id,vid\n100,1\n200,2\n300,3\n400,4\n");
}

#[test]
fn test_rerun_is_idempotent() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();
    let mut loader = fixture.loader();
    let partitioner = FixedPartitioner(vec![0, 0, 1]);

    pipeline.run(&partitioner, &mut loader).unwrap();
    let second = pipeline.run(&partitioner, &mut loader).unwrap();

    assert_eq!(second.identity.assigned, 0);
    assert_eq!(second.identity.already_known, 4);

    let stores = loader.into_stores();
    assert_eq!(stores[0].node_count(), 2);
    assert_eq!(stores[0].edge_count(), 2);
    assert_eq!(stores[1].node_count(), 1);

    let ledger = CrossShardLedger::load(&fixture.state(), RelationType::PersonKnowsPerson).unwrap();
    assert_eq!(ledger.len(), 1);
}

#[test]
fn test_stages_can_run_separately() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();

    pipeline.assign_vids().unwrap();
    let (outputs, _) = pipeline.build_graph().unwrap();
    assert_eq!(
        fs::read_to_string(&outputs.graph_path).unwrap(),
        "3 2\n2\n1 3\n2\n"
    );

    fs::write(pipeline.partition_file(), "1\n1\n0\n").unwrap();
    pipeline.resolve(None).unwrap();

    let mut loader = fixture.loader();
    pipeline.load_nodes(&mut loader).unwrap();
    let rels = pipeline
        .load_relationships(&mut loader, &[RelationType::PersonKnowsPerson])
        .unwrap();

    assert_eq!(rels.direct_edges, 1);
    assert_eq!(rels.proxy_edges, 1);
    let stores = loader.into_stores();
    assert!(stores[1]
        .proxy_edge(RelationType::PersonKnowsPerson, Vid(2), Vid(3))
        .is_some());
    assert!(stores[0]
        .edge(RelationType::PersonKnowsPerson, Vid(2), Vid(3))
        .is_none());
}

#[test]
fn test_relationships_need_loaded_nodes() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();
    pipeline.assign_vids().unwrap();
    pipeline.build_graph().unwrap();
    pipeline.partition(&FixedPartitioner(vec![0, 0, 1])).unwrap();
    pipeline.resolve(None).unwrap();

    let mut loader = fixture.loader();
    let report = pipeline
        .load_relationships(&mut loader, &[RelationType::PersonKnowsPerson])
        .unwrap();

    // edges are routed but the stores match no endpoints
    assert_eq!(report.writes.total().written, 0);
    assert_eq!(report.writes.total().skipped(), 2);
}

#[test]
fn test_missing_inputs_are_fatal() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();

    // no vid maps yet
    assert!(matches!(pipeline.build_graph(), Err(PipelineError::Identity(_))));

    pipeline.assign_vids().unwrap();
    pipeline.build_graph().unwrap();

    // no partitioner output yet
    assert!(matches!(
        pipeline.resolve(None),
        Err(PipelineError::Partition(PartitionError::MissingInput { .. }))
    ));

    // configured relationship file removed
    let knows = fixture
        .dir
        .path()
        .join("social_network/dynamic/person_knows_person_0_0.csv");
    fs::remove_file(knows).unwrap();
    assert!(matches!(
        pipeline.build_graph(),
        Err(PipelineError::Partition(PartitionError::Dataset(DatasetError::NotFound { .. })))
    ));
}

#[test]
fn test_assignment_for_another_shard_count_is_reported() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();
    pipeline.assign_vids().unwrap();

    // resolved for three shards, loaded with two
    fs::write(fixture.state().join(ASSIGNMENT_FILE), "vid,sid\n1,0\n2,0\n3,2\n").unwrap();

    let mut loader = fixture.loader();
    let report = pipeline.load_nodes(&mut loader).unwrap();

    assert_eq!(report.invalid_assignments, 1);
    // vid 3 lost its shard and vid 4 never had one
    assert_eq!(report.unroutable, 2);
    assert_eq!(report.writes.total().written, 2);
    assert_eq!(report.records, report.unparseable + report.unroutable + 2);

    let unroutable = UnroutableLog::load(&fixture.state()).unwrap();
    assert!(unroutable.contains(Vid(3)) && unroutable.contains(Vid(4)));

    let stores = loader.into_stores();
    assert_eq!(stores[1].node_count(), 0);
}

#[test]
fn test_unroutable_vids_are_dropped_once_placed() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();
    let mut loader = fixture.loader();

    pipeline
        .run(&FixedPartitioner(vec![0, 0, 1]), &mut loader)
        .unwrap();
    assert!(UnroutableLog::load(&fixture.state()).unwrap().contains(Vid(4)));

    // Dee now knows Ada, so vid 4 enters the partition graph
    let knows = fixture
        .dir
        .path()
        .join("social_network/dynamic/person_knows_person_0_0.csv");
    fs::write(&knows, format!("{KNOWS}400|100|2014-01-01T00:00:00.000+0000\n")).unwrap();

    let second = pipeline
        .run(&FixedPartitioner(vec![0, 0, 1, 1]), &mut loader)
        .unwrap();

    assert_eq!(second.nodes.unroutable, 0);
    let stores = loader.into_stores();
    assert!(stores[1].node(EntityType::Person, Vid(4)).is_some());

    let unroutable = UnroutableLog::load(&fixture.state()).unwrap();
    assert!(unroutable.is_empty());
    assert_eq!(
        fs::read_to_string(fixture.state().join(UNROUTABLE_FILE)).unwrap(),
        "vid,entity\n"
    );
}
