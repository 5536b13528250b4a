//! Textual heap plots
//!
//! Renders one symbolic heap as a `dot` graph: objects become boxes
//! annotated with their kind, size, validity and segment metadata; fields
//! become labelled edges; predicates become dashed edges. Purely a
//! diagnostic aid, written to a stream named after the heap's trace id.

use crate::heap::{CustomValue, ObjId, ObjKind, StorClass, SymHeap, ValTarget};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn obj_label(sh: &SymHeap, obj: ObjId) -> String {
    let kind = match sh.obj_kind(obj) {
        ObjKind::Region => "region".to_string(),
        ObjKind::Sls => format!("SLS(min {})", sh.seg_min_length(obj)),
        ObjKind::Dls => format!("DLS(min {})", sh.seg_min_length(obj)),
        ObjKind::MayExist => "may-exist".to_string(),
        ObjKind::Head => "head-of".to_string(),
        ObjKind::Part => "part-of".to_string(),
    };

    let size = sh.obj_size(obj);
    let size = if size.is_single() {
        format!("{}B", size.lo)
    } else {
        format!("{}..{}B", size.lo, size.hi)
    };

    let stor = match sh.obj_stor_class(obj) {
        StorClass::Var(cv) => format!(" {}", sh.stor().var(cv.uid).name),
        StorClass::OnHeap => " heap".to_string(),
        StorClass::Return => " ret".to_string(),
        StorClass::Invalid => String::new(),
    };

    let validity = if sh.is_valid(obj) { "" } else { " INVALID" };

    format!("#{} {} {}{}{}", obj.0, kind, size, stor, validity)
}

/// Write the heap as a `dot` graph.
pub fn plot_heap<W: Write>(sh: &SymHeap, name: &str, out: &mut W) -> io::Result<()> {
    writeln!(out, "digraph \"{}\" {{", name)?;
    writeln!(out, "    label=\"{}\";", name)?;
    writeln!(out, "    node [shape=box];")?;

    let mut emitted_null = false;

    for idx in 0..sh.cnt_objs() as u32 {
        let obj = ObjId(idx);
        if obj == ObjId::INVALID {
            continue;
        }
        if obj == ObjId::RETURN && sh.obj_estimated_type(obj).is_none() {
            continue;
        }
        writeln!(out, "    obj{} [label=\"{}\"];", obj.0, obj_label(sh, obj))?;

        for key in sh.gather_live_fields(obj) {
            let Some(v) = sh.peek_field(key) else {
                continue;
            };
            let edge = format!("+{}", key.off);
            match sh.val_target(v) {
                ValTarget::AddrOf { obj: tgt, off } => {
                    let off = if off.is_single() {
                        format!("{}", off.lo)
                    } else {
                        format!("{}..{}", off.lo, off.hi)
                    };
                    writeln!(
                        out,
                        "    obj{} -> obj{} [label=\"{} → off {}\"];",
                        obj.0, tgt.0, edge, off
                    )?;
                }
                ValTarget::Null => {
                    if !emitted_null {
                        writeln!(out, "    null [shape=plaintext, label=\"NULL\"];")?;
                        emitted_null = true;
                    }
                    writeln!(out, "    obj{} -> null [label=\"{}\"];", obj.0, edge)?;
                }
                ValTarget::Custom(cv) => {
                    let text = match cv {
                        CustomValue::Int(n) => format!("{}", n),
                        CustomValue::Str(s) => format!("{:?}", s),
                        CustomValue::Fnc(f) => format!("fnc #{}", f.0),
                    };
                    writeln!(
                        out,
                        "    val{} [shape=ellipse, label=\"{}\"];",
                        v.0, text
                    )?;
                    writeln!(out, "    obj{} -> val{} [label=\"{}\"];", obj.0, v.0, edge)?;
                }
                ValTarget::Unknown(origin) => {
                    writeln!(
                        out,
                        "    val{} [shape=ellipse, label=\"?{:?}\"];",
                        v.0, origin
                    )?;
                    writeln!(out, "    obj{} -> val{} [label=\"{}\"];", obj.0, v.0, edge)?;
                }
                ValTarget::Invalid => {
                    writeln!(out, "    obj{} -> obj0 [label=\"{}\"];", obj.0, edge)?;
                }
            }
        }

        for ub in sh.gather_uniform_blocks(obj) {
            writeln!(
                out,
                "    obj{} -> obj{} [style=dotted, label=\"uniform +{} ({}B)\"];",
                obj.0, obj.0, ub.off, ub.size
            )?;
        }
    }

    for p in sh.preds() {
        writeln!(
            out,
            "    val{} -> val{} [style=dashed, label=\"{:?}\"];",
            p.v1.0, p.v2.0, p.kind
        )?;
    }

    writeln!(out, "}}")
}

/// Plot into `dir`, the file named after the heap's trace id.
pub fn plot_heap_to_file(dir: &Path, sh: &SymHeap, name: &str) -> io::Result<PathBuf> {
    let path = dir.join(format!("heap-{:06}-{}.dot", sh.trace().0, name));
    let mut file = std::fs::File::create(&path)?;
    plot_heap(sh, name, &mut file)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{CVar, FieldKey, IntRange, ValId};
    use crate::trace::TraceId;
    use shale_ir::ProgramBuilder;
    use std::sync::Arc;

    fn sample_heap() -> SymHeap {
        let mut p = ProgramBuilder::new();
        let void = p.types().void();
        let i64t = p.types().int(8);
        let ptr = p.types().ptr(i64t);
        let mut f = p.fnc("f", void);
        let v = f.local("p", ptr);
        f.block("entry");
        f.ret(None);
        f.finish();

        let mut sh = SymHeap::new(Arc::new(p.build()), TraceId(0));
        let reg = sh.region_by_var(CVar::new(v, 0), true);
        let node = sh.heap_alloc(IntRange::single(8));
        let addr = sh.addr_of_region(node);
        sh.write_field(
            FieldKey {
                obj: reg,
                off: 0,
                ty: ptr,
            },
            addr,
        );
        sh.write_field(
            FieldKey {
                obj: node,
                off: 0,
                ty: ptr,
            },
            ValId::NULL,
        );
        sh
    }

    #[test]
    fn plot_mentions_objects_and_edges() {
        let sh = sample_heap();
        let mut buf = Vec::new();
        plot_heap(&sh, "sample", &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.starts_with("digraph \"sample\""));
        assert!(text.contains("region"));
        assert!(text.contains("heap"));
        assert!(text.contains("NULL"));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn plot_writes_a_file_named_after_the_heap() {
        let sh = sample_heap();
        let dir = tempfile::tempdir().unwrap();
        let path = plot_heap_to_file(dir.path(), &sh, "sample").unwrap();
        assert!(path.exists());
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("digraph"));
    }
}
