//! # Object Taxonomy & Iteration
//!
//! Directories become tessera objects through marker files: an array
//! directory carries a schema file, a group carries the group marker, a
//! key-value store carries the reserved key-value schema file. Anything
//! else, including fragment directories, is not an object.
//!
//! [`ObjectIter`] walks a directory tree yielding objects in preorder or
//! postorder, driven by an explicit stack of `(uri, expanded)` records so
//! traversal state lives in the iterator, not the call stack.

use eyre::Result;

use crate::config::{
    ARRAY_SCHEMA_FILENAME, FRAGMENT_METADATA_FILENAME, GROUP_FILENAME, KV_SCHEMA_FILENAME,
};
use crate::uri::Uri;
use crate::vfs::Vfs;

/// What a URI resolves to in the tessera taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Array,
    Group,
    KeyValue,
    Invalid,
}

/// Traversal order for [`ObjectIter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    Preorder,
    Postorder,
}

/// Classifies `uri` by its marker files.
pub fn object_type(vfs: &Vfs, uri: &Uri) -> Result<ObjectType> {
    if !vfs.is_dir(uri)? {
        return Ok(ObjectType::Invalid);
    }
    if vfs.is_file(&uri.join(KV_SCHEMA_FILENAME))? {
        return Ok(ObjectType::KeyValue);
    }
    if vfs.is_file(&uri.join(ARRAY_SCHEMA_FILENAME))? {
        return Ok(ObjectType::Array);
    }
    if vfs.is_file(&uri.join(GROUP_FILENAME))? {
        return Ok(ObjectType::Group);
    }
    Ok(ObjectType::Invalid)
}

/// True when `uri` is a fragment directory (carries a metadata file).
pub fn is_fragment_dir(vfs: &Vfs, uri: &Uri) -> Result<bool> {
    Ok(vfs.is_dir(uri)? && vfs.is_file(&uri.join(FRAGMENT_METADATA_FILENAME))?)
}

/// Tree walk over tessera objects rooted at a path. The root itself is
/// not yielded; iteration covers its descendants (or only its direct
/// children when `recursive` is off).
pub struct ObjectIter {
    /// Pending `(uri, expanded)` records. `expanded` is only meaningful
    /// in postorder: it marks a directory whose children were already
    /// pushed, so its second pop yields it after them.
    stack: Vec<(Uri, bool)>,
    order: WalkOrder,
    recursive: bool,
}

impl ObjectIter {
    pub fn new(vfs: &Vfs, path: &Uri, order: WalkOrder, recursive: bool) -> Result<Self> {
        let mut stack = Vec::new();
        for child in vfs.ls(path)?.into_iter().rev() {
            stack.push((child, false));
        }
        Ok(Self {
            stack,
            order,
            recursive,
        })
    }

    /// The next object and its type, or `None` when the walk is done.
    pub fn next_object(&mut self, vfs: &Vfs) -> Result<Option<(Uri, ObjectType)>> {
        while let Some((uri, expanded)) = self.stack.pop() {
            let ty = object_type(vfs, &uri)?;

            match self.order {
                WalkOrder::Preorder => {
                    if self.recursive && vfs.is_dir(&uri)? {
                        for child in vfs.ls(&uri)?.into_iter().rev() {
                            self.stack.push((child, false));
                        }
                    }
                    if ty != ObjectType::Invalid {
                        return Ok(Some((uri, ty)));
                    }
                }
                WalkOrder::Postorder => {
                    if !expanded && self.recursive && vfs.is_dir(&uri)? {
                        let children = vfs.ls(&uri)?;
                        if !children.is_empty() {
                            self.stack.push((uri, true));
                            for child in children.into_iter().rev() {
                                self.stack.push((child, false));
                            }
                            continue;
                        }
                    }
                    if ty != ObjectType::Invalid {
                        return Ok(Some((uri, ty)));
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    /// Builds: root/g1 (group) containing a1 (array), plus root/plain
    /// (untyped dir) and root/g2 (group).
    fn build_tree(vfs: &Vfs, root: &Uri) {
        let g1 = root.join("g1");
        vfs.create_dir(&g1).unwrap();
        vfs.touch(&g1.join(GROUP_FILENAME)).unwrap();

        let a1 = g1.join("a1");
        vfs.create_dir(&a1).unwrap();
        vfs.touch(&a1.join(ARRAY_SCHEMA_FILENAME)).unwrap();

        let g2 = root.join("g2");
        vfs.create_dir(&g2).unwrap();
        vfs.touch(&g2.join(GROUP_FILENAME)).unwrap();

        vfs.create_dir(&root.join("plain")).unwrap();
    }

    fn names(items: &[(Uri, ObjectType)]) -> Vec<String> {
        items
            .iter()
            .map(|(u, _)| u.last_path_part().to_string())
            .collect()
    }

    fn walk(vfs: &Vfs, root: &Uri, order: WalkOrder, recursive: bool) -> Vec<(Uri, ObjectType)> {
        let mut iter = ObjectIter::new(vfs, root, order, recursive).unwrap();
        let mut out = Vec::new();
        while let Some(item) = iter.next_object(vfs).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn classifies_by_marker_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = Vfs::new(&Config::new());
        build_tree(&vfs, &root);

        assert_eq!(object_type(&vfs, &root.join("g1")).unwrap(), ObjectType::Group);
        assert_eq!(
            object_type(&vfs, &root.join("g1").join("a1")).unwrap(),
            ObjectType::Array
        );
        assert_eq!(
            object_type(&vfs, &root.join("plain")).unwrap(),
            ObjectType::Invalid
        );
        assert_eq!(
            object_type(&vfs, &root.join("missing")).unwrap(),
            ObjectType::Invalid
        );
    }

    #[test]
    fn kv_marker_wins() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = Vfs::new(&Config::new());
        let kv = root.join("kv1");
        vfs.create_dir(&kv).unwrap();
        vfs.touch(&kv.join(KV_SCHEMA_FILENAME)).unwrap();
        assert_eq!(object_type(&vfs, &kv).unwrap(), ObjectType::KeyValue);
    }

    #[test]
    fn preorder_yields_parent_before_children() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = Vfs::new(&Config::new());
        build_tree(&vfs, &root);

        let items = walk(&vfs, &root, WalkOrder::Preorder, true);
        assert_eq!(names(&items), vec!["g1", "a1", "g2"]);
    }

    #[test]
    fn postorder_yields_children_before_parent() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = Vfs::new(&Config::new());
        build_tree(&vfs, &root);

        let items = walk(&vfs, &root, WalkOrder::Postorder, true);
        assert_eq!(names(&items), vec!["a1", "g1", "g2"]);
    }

    #[test]
    fn non_recursive_bounds_to_depth_one() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = Vfs::new(&Config::new());
        build_tree(&vfs, &root);

        let items = walk(&vfs, &root, WalkOrder::Preorder, false);
        assert_eq!(names(&items), vec!["g1", "g2"]);
    }

    #[test]
    fn fragment_dirs_are_not_objects() {
        let dir = tempfile::tempdir().unwrap();
        let root = Uri::from(dir.path());
        let vfs = Vfs::new(&Config::new());

        let frag = root.join("__1_1_aaaaaaaa-0000-4000-8000-000000000000_4");
        vfs.create_dir(&frag).unwrap();
        vfs.touch(&frag.join(FRAGMENT_METADATA_FILENAME)).unwrap();

        assert_eq!(object_type(&vfs, &frag).unwrap(), ObjectType::Invalid);
        assert!(is_fragment_dir(&vfs, &frag).unwrap());
        assert!(walk(&vfs, &root, WalkOrder::Preorder, true).is_empty());
    }
}
