//! Loads the bundled stack file end to end: parse, interpolate, graph, plan

use stack_launch::{DependencyGraph, Interpolator, StackFile, StackPlan};
use std::collections::HashSet;

fn demo_stack() -> StackFile {
    let path = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../launch/observability.stack.yaml"
    );
    StackFile::from_file(path).unwrap()
}

#[test]
fn test_demo_stack_resolves_without_profiles() {
    let stack = demo_stack();
    assert_eq!(stack.profiles(), vec!["tracing".to_string()]);

    let units = stack
        .resolve(&Interpolator::isolated(), &HashSet::new())
        .unwrap();
    let graph = DependencyGraph::build(units).unwrap();
    assert_eq!(graph.len(), 5);
    assert!(graph.unit("tempo").is_none());

    let grafana = graph.unit("grafana").unwrap();
    assert_eq!(grafana.launch.env["GF_SERVER_HTTP_PORT"], "3000");
    assert_eq!(grafana.launch.env["STACK_DATA"], "/tmp/stack-data");
    assert_eq!(grafana.dependency_required("loki"), Some(false));
    assert_eq!(grafana.dependency_required("prometheus"), Some(true));

    let order: Vec<_> = graph.start_order().map(|u| u.name.clone()).collect();
    for unit in graph.start_order() {
        let at = graph.position(&unit.name).unwrap();
        for dep in &unit.dependencies {
            assert!(graph.position(&dep.name).unwrap() < at, "{:?}", order);
        }
    }
}

#[test]
fn test_demo_stack_with_overrides_and_profile() {
    let stack = demo_stack();
    let interpolator = Interpolator::isolated()
        .with_override("GRAFANA_PORT", "3001")
        .with_override("STACK_DATA", "/srv/stack");
    let profiles: HashSet<String> = ["tracing".to_string()].into_iter().collect();

    let units = stack.resolve(&interpolator, &profiles).unwrap();
    let graph = DependencyGraph::build(units).unwrap();
    assert_eq!(graph.len(), 6);

    let grafana = graph.unit("grafana").unwrap();
    assert_eq!(grafana.launch.env["GF_SERVER_HTTP_PORT"], "3001");
    assert_eq!(
        grafana.launch.working_dir.as_deref(),
        Some(std::path::Path::new("/srv/stack"))
    );

    let plan = StackPlan::from_graph(&graph).to_string();
    assert!(plan.contains("http http://localhost:3001/api/health"));
    assert!(plan.contains("Restart: always (max 5 restarts)"));
    assert!(plan.contains("After: loki"));
}
