//! Dependency graph resolver: validation (missing deps, cycles) and a deterministic plan.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::registry::{check_dependency_type, DescriptorStore, RegistryError};

/// Nodes are descriptor names; `deps[u]` lists what `u` depends on.
///
/// Node indices follow name order, so index order doubles as the name tie-break.
#[derive(Debug)]
pub struct DependencyGraph {
    names: Vec<String>,
    priorities: Vec<i32>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build adjacency from the store, failing on the first unknown or mistyped dependency.
    pub fn build(store: &DescriptorStore) -> Result<Self, RegistryError> {
        // Fail fast in registration order so the reported component is stable.
        for d in store.all() {
            for dep in d.dependencies() {
                let target =
                    store
                        .lookup(&dep.name)
                        .ok_or_else(|| RegistryError::MissingDependency {
                            component: d.name().to_string(),
                            missing: dep.name.clone(),
                        })?;
                check_dependency_type(d.name(), dep, target)?;
            }
        }

        let mut sorted: Vec<_> = store.all().iter().collect();
        sorted.sort_by(|a, b| a.name().cmp(b.name()));

        let idx: HashMap<&str, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name(), i))
            .collect();

        let mut deps = vec![Vec::<usize>::new(); sorted.len()];
        let mut dependents = vec![Vec::<usize>::new(); sorted.len()];
        for (u, d) in sorted.iter().enumerate() {
            for name in d.dependency_names() {
                let v = idx[name];
                // duplicate declarations collapse into one edge
                if !deps[u].contains(&v) {
                    deps[u].push(v);
                    dependents[v].push(u);
                }
            }
        }

        Ok(Self {
            names: sorted.iter().map(|d| d.name().to_string()).collect(),
            priorities: sorted.iter().map(|d| d.priority()).collect(),
            deps,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Detect cycles using DFS with path tracking.
    /// Returns the cycle path (first node repeated at the end) if found.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            node: usize,
            graph: &DependencyGraph,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[node] = Mark::InProgress;
            path.push(node);

            for &next in &graph.deps[node] {
                match marks[next] {
                    Mark::InProgress => {
                        // back edge: the cycle is the path suffix starting at `next`
                        let start = path.iter().position(|&n| n == next)?;
                        let mut cycle: Vec<String> = path[start..]
                            .iter()
                            .map(|&i| graph.names[i].clone())
                            .collect();
                        cycle.push(graph.names[next].clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(next, graph, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }

            path.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.names.len()];
        let mut path = Vec::new();
        for i in 0..self.names.len() {
            if marks[i] == Mark::Unvisited {
                if let Some(cycle) = visit(i, self, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Kahn's algorithm; eligible nodes are taken by ascending (priority, name).
    fn topo_order(&self) -> Vec<usize> {
        let mut indeg: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<(i32, usize)>> = indeg
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse((self.priorities[i], i)))
            .collect();

        let mut order = Vec::with_capacity(self.names.len());
        while let Some(Reverse((_, u))) = ready.pop() {
            order.push(u);
            for &w in &self.dependents[u] {
                indeg[w] -= 1;
                if indeg[w] == 0 {
                    ready.push(Reverse((self.priorities[w], w)));
                }
            }
        }
        order
    }

    /// Group nodes by dependency depth; each wave only depends on earlier waves.
    fn waves(&self, order: &[usize]) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.names.len()];
        for &u in order {
            depth[u] = self.deps[u]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut waves: Vec<Vec<usize>> = Vec::new();
        for &u in order {
            if waves.len() <= depth[u] {
                waves.resize_with(depth[u] + 1, Vec::new);
            }
            waves[depth[u]].push(u);
        }
        for wave in &mut waves {
            wave.sort_by_key(|&u| (self.priorities[u], u));
        }
        waves
    }
}

/// Validated start order, its reverse for shutdown, and the parallel waves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    order: Vec<String>,
    waves: Vec<Vec<String>>,
    dependencies: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    /// Build, validate and order the graph. Pure: same descriptor set, same plan.
    pub fn resolve(store: &DescriptorStore) -> Result<Self, RegistryError> {
        let graph = DependencyGraph::build(store)?;

        if let Some(path) = graph.find_cycle() {
            return Err(RegistryError::CyclicDependency { path });
        }

        let order = graph.topo_order();
        let waves = graph.waves(&order);
        let name = |i: &usize| graph.names[*i].clone();

        let dependencies: HashMap<String, Vec<String>> = (0..graph.len())
            .map(|u| (graph.names[u].clone(), graph.deps[u].iter().map(name).collect()))
            .collect();

        let plan = Self {
            order: order.iter().map(name).collect(),
            waves: waves
                .iter()
                .map(|w| w.iter().map(name).collect())
                .collect(),
            dependencies,
        };

        tracing::info!(components = ?plan.order, "Component dependency order resolved (topo)");
        Ok(plan)
    }

    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    pub fn stop_order(&self) -> impl Iterator<Item = &String> {
        self.order.iter().rev()
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    /// Waves for shutdown: dependents first, each wave in reverse start order.
    pub fn stop_waves(&self) -> Vec<Vec<String>> {
        self.waves
            .iter()
            .rev()
            .map(|w| w.iter().rev().cloned().collect())
            .collect()
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ComponentDescriptor;

    struct Dummy;

    fn add(store: &mut DescriptorStore, name: &str, deps: &[&str], priority: i32) {
        let b = deps.iter().fold(
            ComponentDescriptor::builder::<Dummy>()
                .named(name)
                .priority(priority),
            |b, d| b.depends_on(*d),
        );
        store
            .register(b.factory(|_| Ok(Dummy)).build().unwrap())
            .unwrap();
    }

    #[test]
    fn topo_sort_happy_path() {
        let mut s = DescriptorStore::default();
        add(&mut s, "core_b", &["core_a"], 0);
        add(&mut s, "core_a", &[], 0);

        let plan = ExecutionPlan::resolve(&s).unwrap();
        assert_eq!(plan.start_order(), ["core_a", "core_b"]);
        let stop: Vec<_> = plan.stop_order().cloned().collect();
        assert_eq!(stop, vec!["core_b", "core_a"]);
    }

    #[test]
    fn priority_then_name_breaks_ties() {
        let mut s = DescriptorStore::default();
        add(&mut s, "zeta", &[], 0);
        add(&mut s, "alpha", &[], 0);
        add(&mut s, "late", &[], 10);
        add(&mut s, "early", &[], -5);

        let plan = ExecutionPlan::resolve(&s).unwrap();
        assert_eq!(plan.start_order(), ["early", "alpha", "zeta", "late"]);
    }

    #[test]
    fn priority_never_overrides_dependency_edges() {
        let mut s = DescriptorStore::default();
        add(&mut s, "db", &[], 100);
        add(&mut s, "api", &["db"], -100);

        let plan = ExecutionPlan::resolve(&s).unwrap();
        assert_eq!(plan.start_order(), ["db", "api"]);
    }

    #[test]
    fn order_is_independent_of_registration_order() {
        let mut first = DescriptorStore::default();
        add(&mut first, "a", &[], 0);
        add(&mut first, "b", &["a"], 0);
        add(&mut first, "c", &["a"], 1);
        add(&mut first, "d", &[], 0);

        let mut second = DescriptorStore::default();
        add(&mut second, "d", &[], 0);
        add(&mut second, "c", &["a"], 1);
        add(&mut second, "b", &["a"], 0);
        add(&mut second, "a", &[], 0);

        assert_eq!(
            ExecutionPlan::resolve(&first).unwrap(),
            ExecutionPlan::resolve(&second).unwrap()
        );
    }

    #[test]
    fn unknown_dependency_error() {
        let mut s = DescriptorStore::default();
        add(&mut s, "x", &["config"], 0);

        match ExecutionPlan::resolve(&s).unwrap_err() {
            RegistryError::MissingDependency { component, missing } => {
                assert_eq!(component, "x");
                assert_eq!(missing, "config");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cyclic_dependency_detected() {
        let mut s = DescriptorStore::default();
        add(&mut s, "a", &["b"], 0);
        add(&mut s, "b", &["a"], 0);

        match ExecutionPlan::resolve(&s).unwrap_err() {
            RegistryError::CyclicDependency { path } => {
                assert_eq!(path, vec!["a", "b", "a"]);
            }
            other => panic!("expected CyclicDependency, got: {other:?}"),
        }
    }

    #[test]
    fn complex_cycle_detection_with_path() {
        let mut s = DescriptorStore::default();
        add(&mut s, "a", &["b"], 0);
        add(&mut s, "b", &["c"], 0);
        add(&mut s, "c", &["a"], 0);
        add(&mut s, "d", &[], 0);

        let err = ExecutionPlan::resolve(&s).unwrap_err();
        match &err {
            RegistryError::CyclicDependency { path } => {
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
                assert!(path.contains(&"c".to_string()));
                assert!(!path.contains(&"d".to_string()));
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected CyclicDependency, got: {other:?}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("cyclic dependency detected"));
        assert!(msg.contains("a -> b -> c -> a"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut s = DescriptorStore::default();
        add(&mut s, "a", &["a"], 0);

        match ExecutionPlan::resolve(&s).unwrap_err() {
            RegistryError::CyclicDependency { path } => assert_eq!(path, vec!["a", "a"]),
            other => panic!("expected CyclicDependency, got: {other:?}"),
        }
    }

    #[test]
    fn waves_group_by_depth() {
        let mut s = DescriptorStore::default();
        add(&mut s, "config", &[], 0);
        add(&mut s, "metrics", &[], 1);
        add(&mut s, "db", &["config"], 0);
        add(&mut s, "cache", &["config"], 0);
        add(&mut s, "api", &["db", "cache"], 0);

        let plan = ExecutionPlan::resolve(&s).unwrap();
        assert_eq!(
            plan.waves(),
            [
                vec!["config".to_string(), "metrics".to_string()],
                vec!["cache".to_string(), "db".to_string()],
                vec!["api".to_string()],
            ]
        );
        assert_eq!(plan.stop_waves()[0], vec!["api".to_string()]);
        assert_eq!(plan.stop_waves()[2], vec!["metrics".to_string(), "config".to_string()]);
        assert_eq!(plan.dependencies_of("api"), ["db", "cache"]);
    }

    #[test]
    fn duplicate_dependency_declarations_collapse() {
        let mut s = DescriptorStore::default();
        add(&mut s, "a", &[], 0);
        add(&mut s, "b", &["a", "a"], 0);

        let plan = ExecutionPlan::resolve(&s).unwrap();
        assert_eq!(plan.start_order(), ["a", "b"]);
    }
}
