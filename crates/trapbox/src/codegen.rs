//! Instruction-graph builder and flattener.
//!
//! Filter programs are built as a DAG of virtual-machine instructions
//! before being flattened into the linear form the kernel accepts. Nodes
//! live in an arena and are referenced by index; construction is
//! hash-consed, so identical subtrees are built once and shared. During
//! flattening an explicit emitted-set guarantees each shared node is
//! emitted exactly once, with relative jump offsets resolved and
//! unconditional hops inserted wherever an 8-bit offset would overflow.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use trapbox_sys::bpf::{
    BPF_ABS, BPF_JA, BPF_JMP, BPF_K, BPF_LD, BPF_MAXINSNS, BPF_RET, BPF_W, SockFilter, bpf_class,
};

pub type NodeId = usize;

/// One DAG node: an opcode, its operand, and up to two successor edges.
/// Conditional jumps use both edges; loads fall through via `jt` alone;
/// returns are leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Node {
    pub code: u16,
    pub k: u32,
    pub jt: Option<NodeId>,
    pub jf: Option<NodeId>,
}

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("filter exceeds the kernel limit of {BPF_MAXINSNS} instructions")]
    ProgramTooLarge,

    #[error("instruction node {0} has a missing successor edge")]
    MissingSuccessor(NodeId),
}

#[derive(Default)]
pub struct CodeGen {
    nodes: Vec<Node>,
    cache: HashMap<Node, NodeId>,
}

impl CodeGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reuse) a node. Identical subtrees collapse to one id.
    pub fn make(&mut self, code: u16, k: u32, jt: Option<NodeId>, jf: Option<NodeId>) -> NodeId {
        let node = Node { code, k, jt, jf };
        if let Some(&id) = self.cache.get(&node) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(node);
        self.cache.insert(node, id);
        id
    }

    /// Unconditional return with the given action word.
    pub fn ret(&mut self, k: u32) -> NodeId {
        self.make(BPF_RET | BPF_K, k, None, None)
    }

    /// Absolute 32-bit load from `seccomp_data`, falling through to `next`.
    pub fn load_abs(&mut self, offset: u32, next: NodeId) -> NodeId {
        self.make(BPF_LD | BPF_W | BPF_ABS, offset, Some(next), None)
    }

    /// Conditional jump; `op` is one of the BPF_J* comparison fields.
    pub fn jump(&mut self, op: u16, k: u32, jt: NodeId, jf: NodeId) -> NodeId {
        self.make(BPF_JMP | op | BPF_K, k, Some(jt), Some(jf))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Visit every node reachable from `root` exactly once.
    pub fn traverse(&self, root: NodeId, mut f: impl FnMut(&Node)) {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.nodes[id];
            f(&node);
            stack.extend(node.jt);
            stack.extend(node.jf);
        }
    }

    /// Visit every node reachable from `root` exactly once, mutably.
    ///
    /// Mutation invalidates the hash-consing cache, so it is dropped;
    /// subsequent `make` calls simply stop sharing with rewritten nodes.
    pub fn traverse_mut(&mut self, root: NodeId, mut f: impl FnMut(&mut Node)) {
        self.cache.clear();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            f(&mut self.nodes[id]);
            let node = self.nodes[id];
            stack.extend(node.jt);
            stack.extend(node.jf);
        }
    }

    /// Flatten the DAG rooted at `root` into a position-independent
    /// instruction vector with resolved jump offsets.
    pub fn compile(&self, root: NodeId) -> Result<Vec<SockFilter>, CodegenError> {
        let mut emitter = Emitter {
            gen: self,
            out: Vec::new(),
            emitted: HashMap::new(),
        };
        emitter.emit(root)?;
        // Instructions were produced back to front.
        emitter.out.reverse();
        Ok(emitter.out)
    }
}

/// Emits instructions successors-first, so every jump target is already
/// placed when its predecessor is encoded. Positions are tracked as
/// distance from the end of the program; a node at reverse position `p`
/// lands at final index `len - 1 - p`, so a branch from reverse position
/// `q` to `p` has relative offset `q - p - 1`.
struct Emitter<'a> {
    gen: &'a CodeGen,
    out: Vec<SockFilter>,
    emitted: HashMap<NodeId, usize>,
}

impl Emitter<'_> {
    fn push(&mut self, insn: SockFilter) -> Result<usize, CodegenError> {
        if self.out.len() >= BPF_MAXINSNS {
            return Err(CodegenError::ProgramTooLarge);
        }
        self.out.push(insn);
        Ok(self.out.len() - 1)
    }

    fn emit(&mut self, root: NodeId) -> Result<usize, CodegenError> {
        // Chains can run to thousands of nodes, so the walk carries its
        // own stack instead of recursing. Each node is visited twice: once
        // to schedule its successors, once to encode it after they have
        // been placed.
        let mut stack = vec![(root, false)];
        while let Some((id, successors_placed)) = stack.pop() {
            if self.emitted.contains_key(&id) {
                continue;
            }
            let node = *self.gen.node(id);
            if !successors_placed {
                stack.push((id, true));
                if bpf_class(node.code) != BPF_RET {
                    stack.push((node.jt.ok_or(CodegenError::MissingSuccessor(id))?, false));
                    if bpf_class(node.code) == BPF_JMP {
                        stack.push((node.jf.ok_or(CodegenError::MissingSuccessor(id))?, false));
                    }
                }
                continue;
            }
            let pos = match bpf_class(node.code) {
                BPF_RET => self.push(SockFilter::stmt(node.code, node.k))?,
                BPF_JMP => {
                    let jt = node.jt.ok_or(CodegenError::MissingSuccessor(id))?;
                    let jf = node.jf.ok_or(CodegenError::MissingSuccessor(id))?;
                    let mut pt = self.emitted[&jt];
                    let mut pf = self.emitted[&jf];
                    loop {
                        let here = self.out.len();
                        if here - pt - 1 > usize::from(u8::MAX) {
                            pt = self.push(SockFilter::stmt(
                                BPF_JMP | BPF_JA,
                                (here - pt - 1) as u32,
                            ))?;
                            continue;
                        }
                        if here - pf - 1 > usize::from(u8::MAX) {
                            pf = self.push(SockFilter::stmt(
                                BPF_JMP | BPF_JA,
                                (here - pf - 1) as u32,
                            ))?;
                            continue;
                        }
                        let jt = (here - pt - 1) as u8;
                        let jf = (here - pf - 1) as u8;
                        break self.push(SockFilter::jump(node.code, node.k, jt, jf))?;
                    }
                }
                _ => {
                    // Single-successor instruction (loads): the successor
                    // must be the instruction that immediately follows; hop
                    // through an unconditional jump when it was emitted
                    // elsewhere.
                    let next = node.jt.ok_or(CodegenError::MissingSuccessor(id))?;
                    let pn = self.emitted[&next];
                    if pn + 1 != self.out.len() {
                        let here = self.out.len();
                        self.push(SockFilter::stmt(BPF_JMP | BPF_JA, (here - pn - 1) as u32))?;
                    }
                    self.push(SockFilter::stmt(node.code, node.k))?
                }
            };
            self.emitted.insert(id, pos);
        }
        Ok(self.emitted[&root])
    }
}
