use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;

use trip_ingest::{
    run_pipeline, ChunkEnricher, Coordinate, Pipeline, PipelineConfig, PlaceLookup,
    PlaceResolution, PlacesService, ResolutionError, ResolverCache, SqliteTripStore,
};

const TRIPS_CSV: &str = "region,origin_coord,destination_coord,datetime,datasource
Prague,POINT (14.4973794438195 50.00136875782316),POINT (14.43109483523328 50.04052930943246),2018-05-28 09:03:40,funny_car
Prague,POINT (14.4973794438195 50.00136875782316),POINT (14.32427345662177 50.00002074358429),2018-05-13 08:52:25,cheap_mobile
Turin,not a point,POINT (7.541509189114433 45.09160503827746),2018-05-21 02:54:04,baba_car
Hamburg,\"53.5,10.0\",,2018-05-04 11:00:00,pt_search_app
";

#[derive(Default)]
struct CountingLookup {
    calls: AtomicUsize,
}

#[async_trait]
impl PlaceLookup for CountingLookup {
    async fn nearest_place(&self, point: Coordinate) -> Result<PlaceResolution, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (name, country_code) = match point.latitude() {
            lat if lat > 52.0 => ("Hamburg", "DE"),
            lat if lat > 49.0 => ("Prague", "CZ"),
            _ => ("Turin", "IT"),
        };
        Ok(PlaceResolution {
            name: name.into(),
            country_code: country_code.into(),
        })
    }
}

struct OfflineLookup;

#[async_trait]
impl PlaceLookup for OfflineLookup {
    async fn nearest_place(&self, _point: Coordinate) -> Result<PlaceResolution, ResolutionError> {
        Err(ResolutionError::Unavailable("resolver offline".into()))
    }
}

fn pipeline_over(
    lookup: Arc<dyn PlaceLookup>,
    database: &Path,
    chunk_size: usize,
) -> Pipeline<SqliteTripStore> {
    let cache = Arc::new(ResolverCache::new(PlacesService::from_lookup(lookup)));
    let store = SqliteTripStore::open(database, 2).unwrap();
    Pipeline::new(store, ChunkEnricher::new(cache, true), chunk_size)
}

fn origin_cities(store: &SqliteTripStore) -> Vec<(String, Option<String>, Option<f64>)> {
    let mut stmt = store
        .connection()
        .prepare("SELECT REGION, ORIGIN_CITY, ORIGIN_LATITUDE FROM TRIPS ORDER BY DEPARTURE_TIME")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

#[tokio::test]
async fn shared_coordinates_resolve_once_and_bad_rows_survive() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("trips.csv");
    fs::write(&input, TRIPS_CSV).unwrap();

    let lookup = Arc::new(CountingLookup::default());
    let mut pipeline = pipeline_over(lookup.clone(), &dir.path().join("trips.db"), 3);
    let report = pipeline.run_file(&input).await.unwrap();

    assert_eq!(report.chunks_processed, 2);
    assert_eq!(report.rows_attempted, 4);
    assert_eq!(report.rows_loaded, 4);
    assert!(report.is_complete());
    assert_eq!(report.enrichment.parse_failures, 2);
    // Five distinct coordinates; the repeated Prague origin is looked up once.
    assert_eq!(lookup.calls.load(Ordering::SeqCst), 5);
    assert_eq!(report.cache.entries, 5);

    let store = pipeline.into_store();
    assert_eq!(store.row_count().unwrap(), 4);
    assert_eq!(store.staged_row_count().unwrap(), 0);

    let rows = origin_cities(&store);
    let turin = rows.iter().find(|(region, _, _)| region == "Turin").unwrap();
    assert_eq!(turin.1, None);
    assert_eq!(turin.2, None);
    let prague: Vec<_> = rows.iter().filter(|(region, _, _)| region == "Prague").collect();
    assert_eq!(prague.len(), 2);
    assert!(prague
        .iter()
        .all(|(_, city, lat)| city.as_deref() == Some("Prague") && *lat == Some(50.00136875782316)));
}

#[tokio::test]
async fn rerunning_the_same_file_loads_nothing_twice() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("trips.csv");
    let database = dir.path().join("trips.db");
    fs::write(&input, TRIPS_CSV).unwrap();

    let first = pipeline_over(Arc::new(CountingLookup::default()), &database, 2)
        .run_file(&input)
        .await
        .unwrap();
    assert_eq!(first.chunks_loaded, vec![1, 2]);

    let mut pipeline = pipeline_over(Arc::new(CountingLookup::default()), &database, 2);
    let second = pipeline.run_file(&input).await.unwrap();
    assert_eq!(second.rows_loaded, 0);
    assert_eq!(second.chunks_already_loaded, vec![1, 2]);
    assert_eq!(pipeline.store().row_count().unwrap(), 4);
}

#[tokio::test]
async fn rerun_after_an_outage_does_not_duplicate_rows() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("trips.csv");
    let database = dir.path().join("trips.db");
    fs::write(&input, TRIPS_CSV).unwrap();

    let outage = pipeline_over(Arc::new(OfflineLookup), &database, 50_000)
        .run_file(&input)
        .await
        .unwrap();
    assert_eq!(outage.chunks_loaded, vec![1]);
    assert_eq!(outage.enrichment.enriched, 0);

    let mut pipeline = pipeline_over(Arc::new(CountingLookup::default()), &database, 50_000);
    let recovered = pipeline.run_file(&input).await.unwrap();
    assert!(recovered.chunks_loaded.is_empty());
    assert_eq!(recovered.chunks_already_loaded, vec![1]);
    assert_eq!(recovered.rows_loaded, 0);
    assert_eq!(pipeline.store().row_count().unwrap(), 4);
}

#[tokio::test]
async fn invalid_utf8_in_one_record_does_not_stop_the_run() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("trips.csv");
    let mut bytes = b"region,origin_coord,destination_coord,datetime,datasource\n".to_vec();
    bytes.extend_from_slice(b"Prague,\"50.0,14.4\",,2018-05-28 09:03:40,funny_car\n");
    bytes.extend_from_slice(b"Bad\xff,\"50.1\xff,14.4\",,2018-05-28 09:04:40,funny_car\n");
    bytes.extend_from_slice(b"Turin,\"45.0,7.6\",,2018-05-21 02:54:04,baba_car\n");
    fs::write(&input, bytes).unwrap();

    let mut pipeline = pipeline_over(
        Arc::new(CountingLookup::default()),
        &dir.path().join("trips.db"),
        1,
    );
    let report = pipeline.run_file(&input).await.unwrap();
    assert_eq!(report.chunks_loaded, vec![1, 2, 3]);
    assert!(report.is_complete());
    // The damaged origin no longer parses; the other two do.
    assert_eq!(report.enrichment.enriched, 2);

    let store = pipeline.into_store();
    assert_eq!(store.row_count().unwrap(), 3);
    let rows = origin_cities(&store);
    let damaged = rows.iter().find(|(region, _, _)| region.starts_with("Bad")).unwrap();
    assert_eq!(damaged.1, None);
    assert!(rows
        .iter()
        .any(|(region, city, _)| region == "Turin" && city.as_deref() == Some("Turin")));
}

#[tokio::test]
async fn missing_input_fails_the_run() {
    let dir = tempdir().unwrap();
    let mut pipeline = pipeline_over(
        Arc::new(CountingLookup::default()),
        &dir.path().join("trips.db"),
        10,
    );
    assert!(pipeline.run_file(dir.path().join("absent.csv")).await.is_err());
}

#[tokio::test]
async fn configured_gazetteer_drives_a_full_run() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("trips.csv");
    let gazetteer = dir.path().join("cities.csv");
    let database = dir.path().join("out/trips.db");
    let journal = dir.path().join("events.jsonl");
    fs::write(&input, TRIPS_CSV).unwrap();
    fs::write(
        &gazetteer,
        "lat,lon,name,admin1,admin2,cc\n50.08,14.42,Prague,Praha,,CZ\n45.07,7.68,Turin,Piedmont,,IT\n53.55,9.99,Hamburg,Hamburg,,DE\n",
    )
    .unwrap();

    let mut config = PipelineConfig::default();
    config.database_path = database.clone();
    config.gazetteer_path = Some(gazetteer);
    config.telemetry_path = Some(journal.clone());
    config.chunk_size = 50_000;

    let report = run_pipeline(&config, &input).await.unwrap();
    assert_eq!(report.rows_loaded, 4);
    assert_eq!(report.chunks_processed, 1);

    let store = SqliteTripStore::open(&database, 10).unwrap();
    let hamburg: String = store
        .connection()
        .query_row(
            "SELECT ORIGIN_COUNTRY FROM TRIPS WHERE REGION = 'Hamburg'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(hamburg, "DE");

    let events = fs::read_to_string(&journal).unwrap();
    assert!(events.contains("\"run_started\""));
    assert!(events.contains("\"chunk_loaded\""));
    assert!(events.contains("\"run_completed\""));
}

#[tokio::test]
async fn run_without_any_lookup_is_a_config_error() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("trips.csv");
    fs::write(&input, TRIPS_CSV).unwrap();

    let mut config = PipelineConfig::default();
    config.database_path = dir.path().join("trips.db");
    let err = run_pipeline(&config, &input).await.unwrap_err();
    assert!(err.to_string().contains("no place lookup configured"));
}
