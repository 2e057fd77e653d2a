//! Restoration of a crashed worker's stack.

use tracing::{debug, info};

use crate::context::{ExecutionContext, SystemMode};
use crate::error::{Result, RuntimeError};

/// Replay the suspended calls persisted on `ctx`'s stack.
///
/// The RAM mirror is rebuilt from the region, then the recovery entry point
/// of every frame above the root runs, most recent first, and its frame is
/// removed. The root frame stays in place. Returns the number of frames
/// recovered.
pub fn do_restoration(ctx: &mut ExecutionContext) -> Result<usize> {
    if ctx.mode() != SystemMode::Recovery {
        return Err(RuntimeError::IllegalRecoveryCall);
    }
    ctx.reload_stack()?;

    let mut recovered = 0;
    while ctx.ram_stack().len() > 1 {
        let (name, args) = match ctx.ram_stack().get_last_frame() {
            Some(top) => (
                top.frame.function_name().to_string(),
                top.frame.args().to_vec(),
            ),
            None => break,
        };
        let entry = ctx.system().registry().lookup(&name, true)?;
        debug!(
            thread_id = ctx.thread_id(),
            function = %name,
            depth = ctx.ram_stack().len(),
            "recovering frame"
        );
        entry(ctx, &args)?;
        ctx.pop_frame()?;
        recovered += 1;
    }

    info!(thread_id = ctx.thread_id(), recovered, "restoration finished");
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::context::SystemConfig;
    use crate::region::Region;
    use crate::registry::FunctionRegistry;

    fn recording_registry(log: &Arc<Mutex<Vec<String>>>, names: &[&'static str]) -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        for &name in names {
            let log = Arc::clone(log);
            registry.register(
                name,
                |_: &mut ExecutionContext, _: &[u8]| Err(RuntimeError::Task("crash".into())),
                move |_: &mut ExecutionContext, args: &[u8]| {
                    log.lock().push(format!("{name}:{}", args.len()));
                    Ok(())
                },
            );
        }
        registry
    }

    #[test]
    fn test_requires_recovery_mode() {
        let dir = tempfile::tempdir().unwrap();
        let system = Arc::new(
            SystemConfig::new(FunctionRegistry::new(), SystemMode::Execution, 1).unwrap(),
        );
        let stack = Region::create(dir.path().join("s"), 512).unwrap();
        let mut ctx = ExecutionContext::new(system, 0, stack).unwrap();
        assert!(matches!(
            do_restoration(&mut ctx),
            Err(RuntimeError::IllegalRecoveryCall)
        ));
    }

    #[test]
    fn test_recovers_top_down_and_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&log, &["f", "g"]);
        {
            let system =
                Arc::new(SystemConfig::new(registry.clone(), SystemMode::Execution, 1).unwrap());
            let mut ctx =
                ExecutionContext::new(system, 0, Region::create(&path, 1024).unwrap()).unwrap();
            ctx.push_root("main_function").unwrap();
            let frame = crate::frame::StackFrame::new("f", vec![1]).unwrap();
            crate::stack::add_new_frame(&mut ctx.ram_stack, frame, &ctx.stack, None).unwrap();
            assert!(ctx.call("g", &[1, 2]).is_err());
        }

        let system = Arc::new(SystemConfig::new(registry, SystemMode::Recovery, 1).unwrap());
        let mut ctx =
            ExecutionContext::new(system, 0, Region::open(&path, 1024).unwrap()).unwrap();
        assert_eq!(do_restoration(&mut ctx).unwrap(), 2);
        assert_eq!(*log.lock(), vec!["g:2".to_string(), "f:1".to_string()]);
        assert_eq!(ctx.ram_stack().function_names(), vec!["main_function"]);

        // A second pass finds nothing left to do.
        assert_eq!(do_restoration(&mut ctx).unwrap(), 0);
    }

    #[test]
    fn test_unknown_recovery_function() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let system = Arc::new(
                SystemConfig::new(recording_registry(&log, &["f"]), SystemMode::Execution, 1)
                    .unwrap(),
            );
            let mut ctx =
                ExecutionContext::new(system, 0, Region::create(&path, 1024).unwrap()).unwrap();
            ctx.push_root("main_function").unwrap();
            assert!(ctx.call("f", &[]).is_err());
        }
        let system = Arc::new(
            SystemConfig::new(FunctionRegistry::new(), SystemMode::Recovery, 1).unwrap(),
        );
        let mut ctx =
            ExecutionContext::new(system, 0, Region::open(&path, 1024).unwrap()).unwrap();
        assert!(matches!(
            do_restoration(&mut ctx),
            Err(RuntimeError::UnknownFunction(name)) if name == "f"
        ));
    }
}
