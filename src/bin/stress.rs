//! viewsync Stress Driver
//!
//! Drives the full pipeline end-to-end with a synthetic upstream source:
//! commits flow through the streamer and replicator into a view syncer
//! whose client consumes pokes as fast as it can.
//! Run with: `cargo run --release --bin stress -- [OPTIONS]`
//!
//! ```bash
//! # Default: 1000 commits, 10 rows each
//! cargo run --release --bin stress
//!
//! # Bigger commits, more of them
//! cargo run --release --bin stress -- --commits 5000 --rows 50
//! ```

use std::collections::BTreeMap;
use std::time::Instant;

use viewsync::ast::Query;
use viewsync::client::{DesiredQueryOp, Downstream, Upstream};
use viewsync::source::CustomSource;
use viewsync::types::{
    Change, ClientGroupId, ClientId, ColumnSpec, ColumnType, QueryHash, Row, SqliteValue,
    TableSpec, Watermark,
};
use viewsync::{Config, Engine};

struct Options {
    commits: u64,
    rows_per_commit: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            commits: 1000,
            rows_per_commit: 10,
        }
    }
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--commits" => {
                i += 1;
                options.commits = args[i].parse().expect("--commits takes a number");
            }
            "--rows" => {
                i += 1;
                options.rows_per_commit = args[i].parse().expect("--rows takes a number");
            }
            other => {
                eprintln!("unknown option: {other}");
                std::process::exit(2);
            }
        }
        i += 1;
    }
    options
}

fn items_spec() -> TableSpec {
    let mut columns = BTreeMap::new();
    columns.insert(
        "id".to_string(),
        ColumnSpec {
            data_type: ColumnType::Integer,
            not_null: true,
            pos: 0,
        },
    );
    columns.insert(
        "payload".to_string(),
        ColumnSpec {
            data_type: ColumnType::Text,
            not_null: false,
            pos: 1,
        },
    );
    TableSpec {
        name: "items".to_string(),
        columns,
        primary_key: vec!["id".to_string()],
    }
}

#[tokio::main]
async fn main() {
    let options = parse_args();
    let dir = std::env::temp_dir().join(format!("viewsync-stress-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("scratch dir");

    let mut config = Config::default();
    config.replica_file = dir
        .join("stress-replica.db")
        .to_string_lossy()
        .into_owned();
    config.debounce_delay_ms = 0;

    let engine = Engine::new(config).expect("config");
    let (source, feed) = CustomSource::new(vec![items_spec()]);
    let pipeline = engine.start(Box::new(source)).await.expect("pipeline");

    let syncer = pipeline.view_syncer(ClientGroupId::new("stress"));
    let client = ClientId::new("c1");
    let mut frames = syncer
        .add_client(client.clone(), Watermark::MIN)
        .await
        .expect("client");
    syncer
        .message(
            client,
            Upstream::ChangeDesiredQueries {
                desired_queries_patch: vec![DesiredQueryOp::Put {
                    hash: QueryHash::new("all-items"),
                    ast: Query::table("items"),
                }],
            },
        )
        .await
        .expect("desired query");

    let producer = {
        let commits = options.commits;
        let rows = options.rows_per_commit;
        tokio::spawn(async move {
            for commit in 1..=commits {
                let changes: Vec<Change> = (0..rows)
                    .map(|r| {
                        let mut row = Row::new();
                        // Overlapping ids so updates and inserts mix.
                        row.insert(
                            "id".to_string(),
                            SqliteValue::Integer(((commit * rows + r) % (rows * 10)) as i64),
                        );
                        row.insert(
                            "payload".to_string(),
                            SqliteValue::Text(format!("payload-{commit}-{r}")),
                        );
                        Change::Insert {
                            table: "items".to_string(),
                            row,
                        }
                    })
                    .collect();
                feed.send_commit(Watermark::from_u64(commit), changes)
                    .await
                    .expect("feed");
            }
        })
    };

    let started = Instant::now();
    let mut pokes = 0u64;
    let mut patches = 0u64;
    let target = Watermark::from_u64(options.commits);
    let mut cookie = Watermark::MIN;
    while cookie < target {
        match frames.recv().await {
            None => break,
            Some(Downstream::PokeStart(start)) => {
                pokes += 1;
                cookie = start.cookie;
            }
            Some(Downstream::PokePart(part)) => {
                patches += part.entities_patch.map_or(0, |p| p.len() as u64);
            }
            Some(_) => {}
        }
    }
    let elapsed = started.elapsed();

    producer.await.expect("producer");
    println!(
        "{} commits ({} rows each) -> {pokes} pokes, {patches} entity patches in {elapsed:?}",
        options.commits, options.rows_per_commit
    );
    println!(
        "{:.0} commits/sec",
        options.commits as f64 / elapsed.as_secs_f64()
    );

    let _ = syncer.shutdown().await;
    let _ = std::fs::remove_dir_all(&dir);
}
