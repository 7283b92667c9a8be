//! Streaming export for bulk state transfer.
//!
//! An export walks one committed version post-order (left subtree, right
//! subtree, parent) and yields one node per call, lazily resolving through
//! the store. The stream is finite and non-restartable; it ends with the
//! distinguished [`Error::ExportDone`] sentinel so that normal completion
//! is never mistaken for an I/O failure.

use crate::{
    error::Error,
    store::{NodeStore, StoredNode},
    tree::NodeId,
    Version,
};

/// One node of an export stream. Leaves carry their value; branches carry
/// their split key and no value. `version` is the node's logical creation
/// version, which the hash preimage commits to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportNode {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub version: Version,
    pub height: u8,
}

enum Frame {
    Enter(NodeId),
    Exit {
        key: Vec<u8>,
        version: Version,
        height: u8,
    },
}

/// A lazy post-order producer over one committed version's nodes.
pub struct Exporter<'a> {
    store: &'a NodeStore,
    stack: Vec<Frame>,
}

impl<'a> Exporter<'a> {
    pub(crate) fn new(store: &'a NodeStore, root: Option<NodeId>) -> Self {
        Exporter {
            store,
            stack: root.map(Frame::Enter).into_iter().collect(),
        }
    }

    /// The next node of the stream, or `Error::ExportDone` once the whole
    /// version has been produced.
    pub fn next(&mut self) -> Result<ExportNode, Error> {
        loop {
            match self.stack.pop() {
                None => return Err(Error::ExportDone),
                Some(Frame::Exit {
                    key,
                    version,
                    height,
                }) => {
                    return Ok(ExportNode {
                        key,
                        value: None,
                        version,
                        height,
                    })
                }
                Some(Frame::Enter(id)) => match self.store.resolve(id)? {
                    StoredNode::Leaf(leaf) => {
                        return Ok(ExportNode {
                            key: leaf.key.into_owned(),
                            value: Some(leaf.value.into_owned()),
                            version: leaf.version,
                            height: 0,
                        });
                    }
                    StoredNode::Branch(branch) => {
                        self.stack.push(Frame::Exit {
                            key: branch.key.into_owned(),
                            version: branch.version,
                            height: branch.height,
                        });
                        self.stack.push(Frame::Enter(branch.right));
                        self.stack.push(Frame::Enter(branch.left));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;
    use crate::{mutable::MutableTree, store::StoreOptions};

    fn drain(mut exporter: Exporter) -> Vec<ExportNode> {
        let mut nodes = Vec::new();
        loop {
            match exporter.next() {
                Ok(node) => nodes.push(node),
                Err(Error::ExportDone) => return nodes,
                Err(err) => panic!("export failed: {:?}", err),
            }
        }
    }

    #[test]
    fn exports_post_order() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = MutableTree::open(dir.path(), StoreOptions::default()).expect("open");
        tree.set(b"a", b"1").expect("set");
        tree.set(b"b", b"2").expect("set");
        tree.set(b"c", b"3").expect("set");
        tree.commit().expect("commit");

        let view = tree.get_immutable(1).expect("view");
        let nodes = drain(view.export());
        // 3 leaves and 2 branches; every parent follows both its children
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes.iter().filter(|n| n.height == 0).count(), 3);
        let leaf_keys: Vec<&[u8]> = nodes
            .iter()
            .filter(|n| n.height == 0)
            .map(|n| n.key.as_slice())
            .collect();
        assert_eq!(leaf_keys, vec![b"a", b"b", b"c"]);
        assert_eq!(nodes[0].key, b"a".to_vec());
        assert_eq!(nodes[0].value.as_deref(), Some(b"1".as_slice()));
        assert_eq!(nodes.last().expect("root").height, 2);
        assert_eq!(nodes.last().expect("root").value, None);
    }

    #[test]
    fn done_sentinel_is_sticky() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = MutableTree::open(dir.path(), StoreOptions::default()).expect("open");
        tree.set(b"k", b"v").expect("set");
        tree.commit().expect("commit");

        let view = tree.get_immutable(1).expect("view");
        let mut exporter = view.export();
        assert!(exporter.next().is_ok());
        assert_matches!(exporter.next(), Err(Error::ExportDone));
        assert_matches!(exporter.next(), Err(Error::ExportDone));
    }

    #[test]
    fn empty_version_exports_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let mut tree = MutableTree::open(dir.path(), StoreOptions::default()).expect("open");
        tree.commit().expect("commit empty");
        let view = tree.get_immutable(1).expect("view");
        assert_matches!(view.export().next(), Err(Error::ExportDone));
    }
}
