use std::collections::BTreeMap;

/// Canonical form of a store path: `/` followed by the non-empty segments.
///
/// `data/os_name`, `/data/os_name` and `/data//os_name/` name the same node.
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Whether a change to `changed` is visible to a watch on `watched`.
pub fn is_under(watched: &str, changed: &str) -> bool {
    let watched = normalize(watched);
    let changed = normalize(changed);
    watched == "/" || changed == watched || changed.starts_with(&format!("{}/", watched))
}

/// Hierarchical node map. Writing a node materializes its ancestors with
/// empty values, so every stored key except the root has a stored parent.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: BTreeMap<String, String>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, path: &str) -> Option<&str> {
        let key = normalize(path);
        if key == "/" {
            return Some("");
        }
        self.nodes.get(&key).map(String::as_str)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.read(path).is_some()
    }

    pub fn write(&mut self, path: &str, value: &str) {
        let key = normalize(path);
        if key == "/" {
            return;
        }

        let mut ancestor = String::new();
        let segments: Vec<&str> = key[1..].split('/').collect();
        for segment in &segments[..segments.len() - 1] {
            ancestor.push('/');
            ancestor.push_str(segment);
            self.nodes.entry(ancestor.clone()).or_default();
        }
        self.nodes.insert(key, value.to_string());
    }

    /// Remove a node and its subtree. Returns `false` if it did not exist.
    pub fn remove(&mut self, path: &str) -> bool {
        let key = normalize(path);
        if key == "/" {
            let had_nodes = !self.nodes.is_empty();
            self.nodes.clear();
            return had_nodes;
        }

        if self.nodes.remove(&key).is_none() {
            return false;
        }
        let prefix = format!("{}/", key);
        self.nodes.retain(|k, _| !k.starts_with(&prefix));
        true
    }

    /// Names of the direct children of `path`, or `None` if it does not exist.
    pub fn children(&self, path: &str) -> Option<Vec<String>> {
        let key = normalize(path);
        if !self.exists(&key) {
            return None;
        }

        let prefix = if key == "/" { key.clone() } else { format!("{}/", key) };
        let names = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Some(names)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("data/os_name"), "/data/os_name");
        assert_eq!(normalize("/data//os_name/"), "/data/os_name");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn test_write_materializes_ancestors() {
        let mut tree = Tree::new();
        tree.write("attr/os/hotfixes/0", "KB1");
        assert_eq!(tree.read("attr"), Some(""));
        assert_eq!(tree.read("attr/os"), Some(""));
        assert_eq!(tree.read("/attr/os/hotfixes/0"), Some("KB1"));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_remove_subtree() {
        let mut tree = Tree::new();
        tree.write("a/b/c", "1");
        tree.write("a/bb", "2");
        assert!(tree.remove("a/b"));
        assert!(!tree.exists("a/b/c"));
        assert_eq!(tree.read("a/bb"), Some("2"));
        assert!(!tree.remove("a/b"));
    }

    #[test]
    fn test_children() {
        let mut tree = Tree::new();
        tree.write("vm/a", "1");
        tree.write("vm/b/x", "2");
        tree.write("vmx", "3");

        assert_eq!(tree.children("vm").unwrap(), vec!["a", "b"]);
        assert_eq!(tree.children("vm/a").unwrap(), Vec::<String>::new());
        assert_eq!(tree.children("/").unwrap(), vec!["vm", "vmx"]);
        assert_eq!(tree.children("nope"), None);
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("data", "data/os_name"));
        assert!(is_under("data", "/data"));
        assert!(!is_under("data", "database"));
        assert!(is_under("/", "anything"));
    }
}
