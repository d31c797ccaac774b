//! An in-process JIT linker for Mach-O/arm64 relocatable objects.
//!
//! [`link_macho_arm64`] takes a freshly compiled object as a byte buffer and
//! produces a laid-out, fixed-up image: the object is turned into a graph of
//! blocks and typed relocation edges, dead code is stripped, GOT entries and
//! branch stubs are synthesized where reach or indirection demand them,
//! addresses are assigned, and AArch64 instruction immediates are patched
//! bit-exactly. The host supplies symbol resolution and memory policy through
//! [`JitLinkContext`] and installs the returned image itself.

use anyhow::ensure;
use graph::LinkGraph;
use graph::SymbolId;

pub(crate) mod aarch64;
pub(crate) mod eh_frame;
pub mod error;
pub mod got_stubs;
pub mod graph;
pub(crate) mod graph_builder;
pub(crate) mod macho;
pub mod passes;

pub use passes::Allocation;
pub use passes::Allocator;
pub use passes::BumpAllocator;
pub use passes::JitLinkContext;
pub use passes::Pass;
pub use passes::PassConfiguration;
pub use passes::Triple;

/// Builds the link graph for an object without running any passes. Exposed so
/// tools and tests can inspect or transform the graph between phases; most
/// callers want [`link_macho_arm64`].
pub fn build_link_graph(object_bytes: &[u8]) -> error::Result<LinkGraph<'_>> {
    graph_builder::build_graph(macho::ObjectFile::parse(object_bytes)?)
}

/// Links one Mach-O/arm64 relocatable object into a ready-to-install image.
///
/// Failures abort the invocation, are reported through
/// [`JitLinkContext::notify_failed`] and then returned; no partial image is
/// produced.
pub fn link_macho_arm64<'data>(
    object_bytes: &'data [u8],
    ctx: &mut dyn JitLinkContext<'data>,
) -> error::Result<Allocation> {
    match try_link(object_bytes, ctx) {
        Ok(image) => Ok(image),
        Err(error) => {
            ctx.notify_failed(&error);
            Err(error)
        }
    }
}

#[tracing::instrument(skip_all, name = "Link")]
fn try_link<'data>(
    object_bytes: &'data [u8],
    ctx: &mut dyn JitLinkContext<'data>,
) -> error::Result<Allocation> {
    let triple = Triple::Arm64AppleDarwin;
    let mut graph = build_link_graph(object_bytes)?;

    let mut config = PassConfiguration::default();
    if ctx.should_add_default_target_passes(triple) {
        let mark_live = ctx.get_mark_live_pass(triple).unwrap_or_else(|| {
            Box::new(|graph: &mut LinkGraph<'data>| {
                passes::mark_all_symbols_live(graph);
                Ok(())
            })
        });
        config.pre_prune_passes.push(mark_live);
        config
            .post_prune_passes
            .push(Box::new(got_stubs::synthesize_got_and_stubs));
    }
    ctx.modify_pass_config(triple, &mut config)?;

    for pass in &mut config.pre_prune_passes {
        pass(&mut graph)?;
    }
    passes::prune(&mut graph);
    for pass in &mut config.post_prune_passes {
        pass(&mut graph)?;
    }

    let mut allocation = ctx.allocator().allocate(&mut graph)?;
    resolve_external_symbols(&mut graph, ctx)?;
    apply_fixups(&graph, &mut allocation)?;
    Ok(allocation)
}

/// Resolves every external symbol referenced from a live block against the
/// host process, between allocation and fixup.
fn resolve_external_symbols<'data>(
    graph: &mut LinkGraph<'data>,
    ctx: &mut dyn JitLinkContext<'data>,
) -> error::Result {
    let mut externals: Vec<SymbolId> = Vec::new();
    let mut seen = foldhash::HashSet::default();
    for block_id in graph.live_block_ids() {
        for edge in graph.block(block_id).edges() {
            if !graph.symbol(edge.target).is_defined() && seen.insert(edge.target) {
                externals.push(edge.target);
            }
        }
    }
    if externals.is_empty() {
        return Ok(());
    }

    let names: Vec<&str> = externals
        .iter()
        .map(|id| {
            graph
                .symbol(*id)
                .name()
                .expect("external symbols always carry a name")
        })
        .collect();
    tracing::debug!("resolving {} external symbols", names.len());
    let addresses = ctx.lookup(&names)?;
    ensure!(
        addresses.len() == names.len(),
        "context resolved {} addresses for {} symbols",
        addresses.len(),
        names.len()
    );
    for (id, address) in externals.into_iter().zip(addresses) {
        graph.set_resolved_address(id, address);
    }
    Ok(())
}

fn apply_fixups(graph: &LinkGraph, allocation: &mut Allocation) -> error::Result {
    for block_id in graph.live_block_ids() {
        let work = allocation.block_mem_mut(block_id);
        for edge in graph.block(block_id).edges() {
            aarch64::apply_fixup(graph, block_id, edge, work)?;
        }
    }
    Ok(())
}
