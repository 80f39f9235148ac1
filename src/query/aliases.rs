use std::collections::{BTreeSet, HashMap, HashSet};

/// Lens names that refer to the same glass. Built from a map of
/// alias -> canonical name and closed over symmetry and chaining, so
/// `A -> B` plus `C -> B` (or `B -> C`) puts all three in one group.
#[derive(Debug, Clone, Default)]
pub struct LensAliases {
    group_of: HashMap<String, usize>,
    members: Vec<Vec<String>>,
    canonical: Vec<String>,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

impl LensAliases {
    pub fn new(map: &HashMap<String, String>) -> Self {
        let mut names: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut intern = |name: &str, names: &mut Vec<String>| -> usize {
            let name = name.trim();
            if let Some(&idx) = index.get(name) {
                return idx;
            }
            names.push(name.to_string());
            index.insert(name.to_string(), names.len() - 1);
            names.len() - 1
        };

        let mut edges = Vec::new();
        let mut keys: HashSet<String> = HashSet::new();
        for (alias, target) in map {
            if alias.trim().is_empty() || target.trim().is_empty() {
                continue;
            }
            let a = intern(alias, &mut names);
            let b = intern(target, &mut names);
            keys.insert(alias.trim().to_string());
            edges.push((a, b));
        }

        let mut uf = UnionFind::new(names.len());
        for (a, b) in edges {
            uf.union(a, b);
        }

        let mut by_root: HashMap<usize, BTreeSet<String>> = HashMap::new();
        for (idx, name) in names.iter().enumerate() {
            by_root.entry(uf.find(idx)).or_default().insert(name.clone());
        }

        let mut aliases = LensAliases::default();
        let mut groups: Vec<BTreeSet<String>> = by_root.into_values().collect();
        groups.sort();
        for group in groups {
            let canonical = group
                .iter()
                .find(|name| !keys.contains(*name))
                .or_else(|| group.iter().next())
                .cloned()
                .unwrap_or_default();
            let id = aliases.members.len();
            for name in &group {
                aliases.group_of.insert(name.clone(), id);
            }
            aliases.members.push(group.into_iter().collect());
            aliases.canonical.push(canonical);
        }
        aliases
    }

    /// Every name equivalent to `lens`, including itself, sorted.
    pub fn expand(&self, lens: &str) -> Vec<String> {
        match self.group_of.get(lens.trim()) {
            Some(&id) => self.members[id].clone(),
            None => vec![lens.to_string()],
        }
    }

    /// Display name of the group `lens` belongs to, or `lens` itself.
    pub fn canonical<'a>(&'a self, lens: &'a str) -> &'a str {
        match self.group_of.get(lens.trim()) {
            Some(&id) => &self.canonical[id],
            None => lens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases(pairs: &[(&str, &str)]) -> LensAliases {
        let map = pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        LensAliases::new(&map)
    }

    #[test]
    fn test_expand_is_symmetric() {
        let a = aliases(&[("XF23mmF1.4 R", "Fujinon 23mm f/1.4")]);
        let expected = vec!["Fujinon 23mm f/1.4".to_string(), "XF23mmF1.4 R".to_string()];
        assert_eq!(a.expand("XF23mmF1.4 R"), expected);
        assert_eq!(a.expand("Fujinon 23mm f/1.4"), expected);
        assert_eq!(a.expand("Other"), vec!["Other".to_string()]);
    }

    #[test]
    fn test_chained_aliases_form_one_group() {
        let a = aliases(&[("A", "B"), ("B", "C"), ("D", "C")]);
        assert_eq!(a.expand("D"), vec!["A", "B", "C", "D"]);
        assert_eq!(a.canonical("A"), "C");
        assert_eq!(a.canonical("D"), "C");
        assert_eq!(a.canonical("Z"), "Z");
    }

    #[test]
    fn test_cycle_falls_back_to_smallest_name() {
        let a = aliases(&[("beta", "alpha"), ("alpha", "beta")]);
        assert_eq!(a.canonical("beta"), "alpha");
    }

    #[test]
    fn test_names_are_trimmed() {
        let a = aliases(&[(" 50mm ", "Nifty Fifty")]);
        assert_eq!(a.canonical("50mm"), "Nifty Fifty");
        assert_eq!(a.expand("50mm "), vec!["50mm", "Nifty Fifty"]);
        assert!(!a.is_empty());
        assert!(LensAliases::default().is_empty());
    }
}
