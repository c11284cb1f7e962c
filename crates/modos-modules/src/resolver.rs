//! Start order from declared module dependencies.

use std::collections::{BTreeMap, HashSet};

use modos_protocol::{Module, ModuleId, RuntimeError, RuntimeResult};

/// Dependency-first start order over `modules`.
///
/// Modules are visited in name order and dependencies in declared order, so
/// the result is deterministic for a given set of manifests.
pub fn resolve_order(modules: &[Module]) -> RuntimeResult<Vec<ModuleId>> {
    let graph: BTreeMap<&ModuleId, &Module> =
        modules.iter().map(|module| (&module.name, module)).collect();
    let mut resolver = Resolver {
        graph: &graph,
        visited: HashSet::new(),
        path: Vec::new(),
        order: Vec::with_capacity(graph.len()),
    };
    for name in graph.keys() {
        resolver.visit(name)?;
    }
    Ok(resolver.order)
}

/// Start order restricted to `target` and everything it transitively needs.
pub fn resolve_closure(modules: &[Module], target: &str) -> RuntimeResult<Vec<ModuleId>> {
    let graph: BTreeMap<&ModuleId, &Module> =
        modules.iter().map(|module| (&module.name, module)).collect();
    let target = ModuleId::from(target);
    if !graph.contains_key(&target) {
        return Err(RuntimeError::ModuleNotFound(target.to_string()));
    }
    let mut resolver = Resolver {
        graph: &graph,
        visited: HashSet::new(),
        path: Vec::new(),
        order: Vec::new(),
    };
    resolver.visit(&target)?;
    Ok(resolver.order)
}

struct Resolver<'a> {
    graph: &'a BTreeMap<&'a ModuleId, &'a Module>,
    visited: HashSet<ModuleId>,
    path: Vec<ModuleId>,
    order: Vec<ModuleId>,
}

impl Resolver<'_> {
    fn visit(&mut self, name: &ModuleId) -> RuntimeResult<()> {
        if self.visited.contains(name) {
            return Ok(());
        }
        if let Some(start) = self.path.iter().position(|entry| entry == name) {
            let mut cycle: Vec<String> = self.path[start..]
                .iter()
                .map(ToString::to_string)
                .collect();
            cycle.push(name.to_string());
            return Err(RuntimeError::CircularDependency(cycle));
        }

        let graph = self.graph;
        let module = graph
            .get(name)
            .ok_or_else(|| RuntimeError::ModuleNotFound(name.to_string()))?;

        self.path.push(name.clone());
        for dependency in &module.dependencies {
            if !graph.contains_key(dependency) {
                return Err(RuntimeError::UnresolvedDependency {
                    module: name.to_string(),
                    dependency: dependency.to_string(),
                });
            }
            self.visit(dependency)?;
        }
        self.path.pop();

        self.visited.insert(name.clone());
        self.order.push(name.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modos_protocol::ModuleType;

    fn module(name: &str, dependencies: &[&str]) -> Module {
        Module::new(name, "1.0.0", ModuleType::Service, format!("/m/{name}"))
            .with_dependencies(dependencies.iter().copied())
    }

    fn names(order: Vec<ModuleId>) -> Vec<String> {
        order.into_iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn dependencies_come_first() {
        let modules = vec![module("a", &["b"]), module("b", &["c"]), module("c", &[])];
        assert_eq!(names(resolve_order(&modules).unwrap()), ["c", "b", "a"]);
    }

    #[test]
    fn independent_modules_sorted_by_name() {
        let modules = vec![module("zeta", &[]), module("alpha", &[]), module("mid", &["zeta"])];
        assert_eq!(
            names(resolve_order(&modules).unwrap()),
            ["alpha", "zeta", "mid"]
        );
    }

    #[test]
    fn cycle_reports_path() {
        let modules = vec![module("a", &["b"]), module("b", &["a"])];
        let error = resolve_order(&modules).unwrap_err();
        assert_eq!(
            error,
            RuntimeError::CircularDependency(vec!["a".into(), "b".into(), "a".into()])
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let modules = vec![module("a", &["a"])];
        assert!(matches!(
            resolve_order(&modules),
            Err(RuntimeError::CircularDependency(path)) if path == ["a", "a"]
        ));
    }

    #[test]
    fn missing_dependency_is_unresolved() {
        let modules = vec![module("a", &["ghost"])];
        assert_eq!(
            resolve_order(&modules).unwrap_err(),
            RuntimeError::UnresolvedDependency {
                module: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn closure_only_includes_what_target_needs() {
        let modules = vec![
            module("a", &["b"]),
            module("b", &[]),
            module("c", &[]),
        ];
        assert_eq!(names(resolve_closure(&modules, "a").unwrap()), ["b", "a"]);
        assert!(matches!(
            resolve_closure(&modules, "nope"),
            Err(RuntimeError::ModuleNotFound(_))
        ));
    }
}
