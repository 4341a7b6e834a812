use cxref::indexer::Indexer;
use cxref::indexer::stable_id::usr_from_str;
use cxref::model::Usr;
use cxref::query;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn copy_dir(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&path, &target);
        } else {
            std::fs::copy(&path, &target).unwrap();
        }
    }
}

fn setup_repo(fixture: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    copy_dir(&fixture_path(fixture), dir.path());
    let db_path = dir.path().join(".cxref").join("cxref.sqlite");
    (dir, db_path)
}

fn usr(text: &str) -> Usr {
    usr_from_str(text)
}

fn sorted_sites(indexer: &Indexer, target: Usr) -> Vec<String> {
    let store = indexer.store().read();
    let mut sites: Vec<String> = query::uses(&store, target, None)
        .into_iter()
        .map(|site| format!("{}:{}", site.path, site.range))
        .collect();
    sites.sort();
    sites
}

#[test]
fn header_records_collapse_across_units() {
    let (dir, db_path) = setup_repo("widgets");
    let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    let stats = indexer.reindex().unwrap();
    assert_eq!(stats.scanned, 3);
    assert_eq!(stats.indexed, 3);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.units, 3);

    let widget = usr("c:@S@Widget");
    assert_eq!(
        sorted_sites(&indexer, widget),
        vec!["a.cc:4:3-4:9", "b.cc:3:6-3:12", "widget.h:3:8-3:14"]
    );

    let store = indexer.store().read();
    let mut contributors = store.contributors(widget);
    contributors.sort();
    assert_eq!(contributors, vec!["a.cc", "b.cc"]);

    let draw = usr("c:@S@Widget@F@draw#");
    let view = query::lookup(&store, draw).unwrap();
    assert_eq!(view.summary.qualified_name, "Widget::draw");
    assert_eq!(view.definition.as_ref().unwrap().path, "b.cc");
    assert_eq!(view.declaration.as_ref().unwrap().path, "widget.h");
    assert_eq!(view.declarations, 1);
    assert_eq!(view.declaring_type, Some(widget));

    let callers = query::callers(&store, draw);
    assert_eq!(callers.len(), 1);
    assert_eq!(callers[0].symbol.name, "main");
    assert_eq!(callers[0].call_site.range, "5:5-5:9");
    let callees = query::callees(&store, usr("c:@F@main#"));
    assert_eq!(callees[0].symbol.usr, draw);

    let mut units = query::file_info(&store, "widget.h").unwrap().units;
    units.sort();
    assert_eq!(units, vec!["a.cc", "b.cc"]);
    drop(store);
    indexer.shutdown().unwrap();
}

#[test]
fn template_instantiations_fold_into_one_entity() {
    let (dir, db_path) = setup_repo("widgets");
    let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    indexer.reindex().unwrap();
    let store = indexer.store().read();

    let foo = usr("c:@ST>1#T@Foo");
    let hits = query::find_by_name(&store, "Foo", 10, false).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].usr, foo);

    let instances: Vec<String> = query::instances(&store, foo)
        .into_iter()
        .map(|summary| summary.qualified_name)
        .collect();
    assert_eq!(instances, vec!["a", "b"]);

    let uses: Vec<(String, bool)> = query::uses(&store, foo, None)
        .into_iter()
        .map(|site| (site.range, site.folded))
        .collect();
    assert_eq!(
        uses,
        vec![
            ("6:30-6:33".to_string(), false),
            ("7:1-7:9".to_string(), true),
            ("8:1-8:10".to_string(), true),
        ]
    );
    assert!(store.entity(usr("c:@S@Foo>#I")).is_none());
    assert!(store.entity(usr("c:@S@Foo>#b")).is_none());
    assert_eq!(store.get_var(usr("c:@a")).unwrap().type_usr, Some(foo));
}

#[test]
fn inheritance_and_enumerators_are_linked() {
    let (dir, db_path) = setup_repo("widgets");
    let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    indexer.reindex().unwrap();
    let store = indexer.store().read();

    let shape = usr("c:@S@Shape");
    let circle = usr("c:@S@Circle");
    let derived: Vec<Usr> = query::derived(&store, shape).iter().map(|s| s.usr).collect();
    let bases: Vec<Usr> = query::bases(&store, circle).iter().map(|s| s.usr).collect();
    assert_eq!(derived, vec![circle]);
    assert_eq!(bases, vec![shape]);

    let members: Vec<(String, Option<i64>)> = query::members(&store, usr("c:@E@Color"))
        .into_iter()
        .map(|member| (member.symbol.name, member.value))
        .collect();
    assert_eq!(
        members,
        vec![
            ("Red".to_string(), Some(0)),
            ("Green".to_string(), Some(20)),
            ("Blue".to_string(), Some(21)),
        ]
    );
    let red = query::lookup(&store, usr("c:@E@Color@Red")).unwrap();
    assert_eq!(red.hover, "Color::Red = 0");
    assert_eq!(red.enum_value, Some(0));
}

#[test]
fn file_outline_and_skipped_ranges() {
    let (dir, db_path) = setup_repo("widgets");
    let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    indexer.reindex().unwrap();
    let store = indexer.store().read();

    let outline: Vec<String> = query::file_symbols(&store, "shapes.cc")
        .into_iter()
        .map(|summary| summary.name)
        .collect();
    assert_eq!(
        outline,
        vec!["Shape", "Circle", "Color", "Red", "Green", "Blue", "Foo", "a", "b"]
    );

    let info = query::file_info(&store, "shapes.cc").unwrap();
    assert_eq!(info.units, vec!["shapes.cc"]);
    assert_eq!(info.skipped_ranges, vec!["10:1-12:7"]);
    let includes = query::file_info(&store, "a.cc").unwrap().includes;
    assert_eq!(includes.len(), 1);
    assert_eq!(includes[0].resolved_path, "widget.h");
}

#[test]
fn locals_are_hidden_from_search_unless_requested() {
    let (dir, db_path) = setup_repo("widgets");
    let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    indexer.reindex().unwrap();
    let store = indexer.store().read();

    let local = usr("c:a.cc@40@F@main#@w");
    let hidden = query::find_by_name(&store, "w", 50, false).unwrap();
    assert!(hidden.iter().all(|hit| hit.usr != local));
    let shown = query::find_by_name(&store, "w", 50, true).unwrap();
    assert_eq!(shown[0].usr, local);

    let main_vars: Vec<Usr> = query::members(&store, usr("c:@F@main#"))
        .into_iter()
        .map(|member| member.symbol.usr)
        .collect();
    assert_eq!(main_vars, vec![local]);
    assert!(query::lookup(&store, local).unwrap().is_local);
}

#[test]
fn reindex_skips_unchanged_and_retracts_removed_units() {
    let (dir, db_path) = setup_repo("widgets");
    let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    indexer.reindex().unwrap();

    let again = indexer.reindex().unwrap();
    assert_eq!(again.indexed, 0);
    assert_eq!(again.skipped, 3);

    // Drop the Widget reference from b.cc.
    let b_events = dir.path().join("b.cc.jsonl");
    let content = std::fs::read_to_string(&b_events).unwrap();
    let trimmed: Vec<&str> = content
        .lines()
        .filter(|line| !line.contains("\"event\":\"reference\""))
        .collect();
    std::fs::write(&b_events, trimmed.join("\n")).unwrap();

    let changed = indexer.reindex().unwrap();
    assert_eq!(changed.indexed, 1);
    assert_eq!(changed.skipped, 2);
    let widget = usr("c:@S@Widget");
    assert_eq!(
        sorted_sites(&indexer, widget),
        vec!["a.cc:4:3-4:9", "widget.h:3:8-3:14"]
    );

    let before = indexer.store().read().unit("b.cc").unwrap().pass;
    let pass = indexer.reindex_unit("b.cc").unwrap().unwrap();
    assert!(pass > before);

    std::fs::remove_file(&b_events).unwrap();
    let removed = indexer.reindex().unwrap();
    assert_eq!(removed.removed, 1);
    assert_eq!(removed.units, 2);

    let store = indexer.store().read();
    assert!(store.unit("b.cc").is_none());
    let draw = usr("c:@S@Widget@F@draw#");
    let view = query::lookup(&store, draw).unwrap();
    assert!(view.definition.is_none());
    assert_eq!(view.declarations, 1);
    assert_eq!(view.contributors, vec!["a.cc"]);
    assert_eq!(store.contributors(widget), vec!["a.cc"]);
}

#[test]
fn snapshot_replays_after_restart() {
    let (dir, db_path) = setup_repo("widgets");
    let (overview, passes) = {
        let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path.clone()).unwrap();
        indexer.reindex().unwrap();
        let (overview, passes) = {
            let store = indexer.store().read();
            let passes: Vec<(String, u64)> = store
                .units()
                .into_iter()
                .map(|record| (record.index.path.clone(), record.pass))
                .collect();
            (serde_json::json!(query::overview(&store)), passes)
        };
        indexer.shutdown().unwrap();
        (overview, passes)
    };

    let mut reopened = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    {
        let store = reopened.store().read();
        assert_eq!(serde_json::json!(query::overview(&store)), overview);
        let replayed: Vec<(String, u64)> = store
            .units()
            .into_iter()
            .map(|record| (record.index.path.clone(), record.pass))
            .collect();
        assert_eq!(replayed, passes);
    }
    assert_eq!(
        sorted_sites(&reopened, usr("c:@S@Widget")),
        vec!["a.cc:4:3-4:9", "b.cc:3:6-3:12", "widget.h:3:8-3:14"]
    );

    let stats = reopened.reindex().unwrap();
    assert_eq!(stats.indexed, 0);
    assert_eq!(stats.skipped, 3);
    let pass = reopened.reindex_unit("a.cc").unwrap().unwrap();
    assert!(passes.iter().all(|(_, earlier)| pass > *earlier));
}

#[test]
fn malformed_lines_do_not_discard_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("broken.cc.jsonl"),
        concat!(
            "{\"event\":\"declare\",\"usr\":\"c:@F@f#\",\"kind\":\"func\",\"detailed_name\":\"void f()\",\"qual_name_offset\":5,\"spell\":{\"file\":\"broken.cc\",\"range\":\"1:6-1:7\"},\"role\":2}\n",
            "{\"event\":\"declare\",\"usr\":\n",
            "{\"event\":\"reference\",\"usr\":\"c:@F@f#\",\"kind\":\"var\",\"span\":{\"file\":\"broken.cc\",\"range\":\"3:1-3:2\"},\"role\":8}\n",
        ),
    )
    .unwrap();
    let db_path = dir.path().join(".cxref").join("cxref.sqlite");
    let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    let stats = indexer.reindex().unwrap();
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.units, 1);

    let store = indexer.store().read();
    let record = store.unit("broken.cc").unwrap();
    assert_eq!(record.index.malformed_events, 1);
    assert_eq!(record.index.conflicts.len(), 1);
    let f = usr("c:@F@f#");
    assert!(store.get_func(f).is_some());
    assert!(query::uses(&store, f, None).is_empty());
}

fn unit_events(unit: &str, func: &str) -> String {
    format!(
        concat!(
            "{{\"event\":\"unit\",\"path\":\"{unit}\"}}\n",
            "{{\"event\":\"declare\",\"usr\":\"c:@F@{func}#\",\"kind\":\"func\",\"detailed_name\":\"void {func}()\",\"qual_name_offset\":5,\"spell\":{{\"file\":\"{unit}\",\"range\":\"1:6-1:7\"}},\"role\":2}}\n",
        ),
        unit = unit,
        func = func,
    )
}

#[test]
fn renamed_unit_header_retracts_the_previous_unit() {
    let dir = tempfile::tempdir().unwrap();
    let events = dir.path().join("a.jsonl");
    std::fs::write(&events, unit_events("x.cc", "f")).unwrap();
    let db_path = dir.path().join(".cxref").join("cxref.sqlite");
    {
        let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path.clone()).unwrap();
        indexer.reindex().unwrap();
        assert!(indexer.store().read().unit("x.cc").is_some());

        std::fs::write(&events, unit_events("y.cc", "g")).unwrap();
        let stats = indexer.reindex().unwrap();
        assert_eq!(stats.indexed, 1);
        assert_eq!(stats.units, 1);

        let store = indexer.store().read();
        assert!(store.unit("x.cc").is_none());
        assert!(store.unit("y.cc").is_some());
        assert!(store.entity(usr("c:@F@f#")).is_none());
        assert!(store.entity(usr("c:@F@g#")).is_some());
    }

    let reopened = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();
    let store = reopened.store().read();
    assert_eq!(store.unit_count(), 1);
    assert!(store.entity(usr("c:@F@f#")).is_none());
}

#[test]
fn second_event_file_for_a_unit_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.jsonl"), unit_events("x.cc", "f")).unwrap();
    std::fs::write(dir.path().join("b.jsonl"), unit_events("x.cc", "g")).unwrap();
    let db_path = dir.path().join(".cxref").join("cxref.sqlite");
    let mut indexer = Indexer::new(dir.path().to_path_buf(), db_path).unwrap();

    let first = indexer.reindex().unwrap();
    assert_eq!(first.indexed, 2);
    assert_eq!(first.duplicates, 1);
    assert_eq!(first.units, 1);

    let second = indexer.reindex().unwrap();
    assert_eq!(second.indexed, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.duplicates, 0);

    // Once the winning file goes away the other one takes the unit over.
    let kept = indexer
        .store()
        .read()
        .unit("x.cc")
        .and_then(|record| record.index.source.clone())
        .unwrap();
    std::fs::remove_file(dir.path().join(&kept)).unwrap();
    let third = indexer.reindex().unwrap();
    assert_eq!(third.removed, 1);
    assert_eq!(third.indexed, 1);
    assert_eq!(third.units, 1);
    let store = indexer.store().read();
    let record = store.unit("x.cc").unwrap();
    assert_ne!(record.index.source.as_deref(), Some(kept.as_str()));
}
