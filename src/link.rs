//! Symlinks. Mirrors `original_source/src/fs/link.cc`'s tiny `Link` class:
//! a link only ever holds a target string and answers `readlink`.
use std::cell::RefCell;
use std::rc::Weak;

use crate::dir::DirNode;

#[derive(Debug)]
pub struct LinkNode {
    pub ino: u64,
    pub name: String,
    pub parent: Weak<RefCell<DirNode>>,
    pub target: String,
}

impl LinkNode {
    pub fn new(ino: u64, name: String, parent: Weak<RefCell<DirNode>>, target: String) -> LinkNode {
        LinkNode {
            ino,
            name,
            parent,
            target,
        }
    }

    pub fn readlink(&self) -> &str {
        &self.target
    }
}
