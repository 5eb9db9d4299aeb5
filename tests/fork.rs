//! Copy-on-write fork from the outside: mapping policy, fault copies and
//! failure paths.

use exokern::mm::{PAGE_SIZE, USTACKTOP, UXSTACKTOP};
use exokern::ulib::UserEnv;
use exokern::{EnvId, EnvStatus, Exokernel, Kernel, KernelConfig, NullConsole, Perm, VirtAddr};

const PRIVATE: VirtAddr = VirtAddr::new(0x0000_1000);
const READ_ONLY: VirtAddr = VirtAddr::new(0x0000_2000);
const SHARED: VirtAddr = VirtAddr::new(0x0000_3000);
const ALREADY_COW: VirtAddr = VirtAddr::new(0x0000_4000);

fn boot(config: KernelConfig) -> (Exokernel, EnvId) {
    let mut k = Kernel::new(config, Box::new(NullConsole)).unwrap();
    let id = k.env_create().unwrap();
    (Exokernel::new(k), id)
}

fn xstack() -> VirtAddr {
    VirtAddr::new(UXSTACKTOP - PAGE_SIZE)
}

fn populate(env: &mut UserEnv<'_>) {
    let me = EnvId::CURRENT;
    env.sys_page_alloc(me, PRIVATE, Perm::USER_RW).unwrap();
    env.write(PRIVATE, b"private").unwrap();
    env.sys_page_alloc(me, READ_ONLY, Perm::REQUIRED).unwrap();
    env.sys_page_alloc(me, SHARED, Perm::USER_RW | Perm::SHARED).unwrap();
    env.write(SHARED, b"shared").unwrap();
    env.sys_page_alloc(me, ALREADY_COW, Perm::USER_COW).unwrap();
}

#[test]
fn mappings_follow_their_kind() {
    let (sys, id) = boot(KernelConfig::default());
    let mut parent = UserEnv::enter(&sys, id);
    populate(&mut parent);
    let forked = parent.fork().unwrap();
    let child = forked.child;

    let both = |va: VirtAddr| (sys.uvpt(id, va).unwrap(), sys.uvpt(child, va).unwrap());

    let (p, c) = both(PRIVATE);
    assert_eq!((p.perm(), c.perm()), (Perm::USER_COW, Perm::USER_COW));
    assert_eq!(p.frame(), c.frame());
    assert_eq!(sys.lock().frame_refs(p.frame()), 2);

    let (p, c) = both(READ_ONLY);
    assert_eq!((p.perm(), c.perm()), (Perm::REQUIRED, Perm::REQUIRED));
    assert_eq!(p.frame(), c.frame());

    let (p, c) = both(SHARED);
    assert_eq!(p.perm(), Perm::USER_RW | Perm::SHARED);
    assert_eq!(c.perm(), p.perm());
    assert_eq!(p.frame(), c.frame());

    let (p, c) = both(ALREADY_COW);
    assert_eq!((p.perm(), c.perm()), (Perm::USER_COW, Perm::USER_COW));

    let (p, c) = both(VirtAddr::new(USTACKTOP - PAGE_SIZE));
    assert_eq!((p.perm(), c.perm()), (Perm::USER_COW, Perm::USER_COW));

    let (p, c) = both(xstack());
    assert_eq!((p.perm(), c.perm()), (Perm::USER_RW, Perm::USER_RW));
    assert_ne!(p.frame(), c.frame());

    let view = sys.env_view(child).unwrap();
    assert_eq!(view.status, EnvStatus::Runnable);
    assert_eq!(view.parent_id, id);
    assert_eq!(view.pgfault_upcall, sys.env_view(id).unwrap().pgfault_upcall);
}

#[test]
fn cow_write_leaves_other_side_untouched() {
    let (sys, id) = boot(KernelConfig::default());
    let mut parent = UserEnv::enter(&sys, id);
    populate(&mut parent);
    let forked = parent.fork().unwrap();
    let mut child = forked.resume_child(&sys).unwrap();
    let original = sys.uvpt(id, PRIVATE).unwrap().frame();

    child.write(PRIVATE, b"mine").unwrap();

    let c = sys.uvpt(forked.child, PRIVATE).unwrap();
    assert_eq!(c.perm(), Perm::USER_RW);
    assert_ne!(c.frame(), original);
    let p = sys.uvpt(id, PRIVATE).unwrap();
    assert_eq!(p.perm(), Perm::USER_COW);
    assert_eq!(p.frame(), original);
    assert_eq!(sys.lock().frame_refs(original), 1);

    let mut buf = [0u8; 7];
    child.read(PRIVATE, &mut buf).unwrap();
    assert_eq!(&buf, b"mineate");
    parent.read(PRIVATE, &mut buf).unwrap();
    assert_eq!(&buf, b"private");

    // the parent still faults on its own first write
    parent.write(PRIVATE, b"P").unwrap();
    let p = sys.uvpt(id, PRIVATE).unwrap();
    assert_eq!(p.perm(), Perm::USER_RW);
}

#[test]
fn write_straddling_two_cow_pages_copies_both() {
    let (sys, id) = boot(KernelConfig::default());
    let mut parent = UserEnv::enter(&sys, id);
    let low = VirtAddr::new(USTACKTOP - 2 * PAGE_SIZE);
    parent.sys_page_alloc(EnvId::CURRENT, low, Perm::USER_RW).unwrap();
    let forked = parent.fork().unwrap();
    let mut child = forked.resume_child(&sys).unwrap();

    let va = VirtAddr::new(USTACKTOP - PAGE_SIZE - 4);
    child.write(va, b"ABCDEFGH").unwrap();

    for page in [low, VirtAddr::new(USTACKTOP - PAGE_SIZE)] {
        let c = sys.uvpt(forked.child, page).unwrap();
        let p = sys.uvpt(id, page).unwrap();
        assert_eq!(c.perm(), Perm::USER_RW);
        assert_eq!(p.perm(), Perm::USER_COW);
        assert_ne!(c.frame(), p.frame());
    }
    let mut buf = [0u8; 8];
    child.read(va, &mut buf).unwrap();
    assert_eq!(&buf, b"ABCDEFGH");
    parent.read(va, &mut buf).unwrap();
    assert_eq!(buf, [0; 8]);
}

#[test]
fn shared_pages_stay_shared() {
    let (sys, id) = boot(KernelConfig::default());
    let mut parent = UserEnv::enter(&sys, id);
    populate(&mut parent);
    let forked = parent.fork().unwrap();
    let mut child = forked.resume_child(&sys).unwrap();

    child.write(SHARED, b"SH").unwrap();
    let mut buf = [0u8; 6];
    parent.read(SHARED, &mut buf).unwrap();
    assert_eq!(&buf, b"SHared");
    assert_eq!(
        sys.uvpt(id, SHARED).unwrap().frame(),
        sys.uvpt(forked.child, SHARED).unwrap().frame()
    );
}

#[test]
fn grandchild_inherits_cow_view() {
    let (sys, id) = boot(KernelConfig::default());
    let mut parent = UserEnv::enter(&sys, id);
    populate(&mut parent);
    let forked = parent.fork().unwrap();
    let mut child = forked.resume_child(&sys).unwrap();
    child.write(PRIVATE, b"child").unwrap();

    let grand = child.fork().unwrap();
    let mut grandchild = grand.resume_child(&sys).unwrap();
    let mut buf = [0u8; 5];
    grandchild.read(PRIVATE, &mut buf).unwrap();
    assert_eq!(&buf, b"child");
    assert_eq!(sys.env_view(grand.child).unwrap().parent_id, forked.child);
}

#[test]
fn fault_without_handler_kills_environment() {
    let (sys, id) = boot(KernelConfig::default());
    let before = sys.lock().free_frames();
    let mut env = UserEnv::enter(&sys, id);
    let err = env.write(VirtAddr::new(0x0050_0000), b"x").unwrap_err();
    assert_eq!(err.env, id);
    assert!(sys.env_view(id).is_none());
    // directory, stack table and stack page all come back
    assert_eq!(sys.lock().free_frames(), before + 3);
}

#[test]
fn fork_without_free_slot_is_fatal() {
    let (sys, id) = boot(KernelConfig {
        env_slots: 1,
        ..KernelConfig::default()
    });
    let mut env = UserEnv::enter(&sys, id);
    let err = env.fork().unwrap_err();
    assert!(err.message.contains("sys_exofork"), "{}", err);
    assert!(sys.env_view(id).is_none());
}

#[test]
fn partial_fork_leaves_child_not_runnable() {
    // room for the parent, its exception stack, the child directory and the
    // child's stack table, but not the child's exception stack
    let (sys, id) = boot(KernelConfig {
        frames: 6,
        ..KernelConfig::default()
    });
    let mut env = UserEnv::enter(&sys, id);
    let err = env.fork().unwrap_err();
    assert!(err.message.contains("sys_page_alloc"), "{}", err);
    assert!(sys.env_view(id).is_none());

    assert_eq!(sys.lock().live_envs(), 1);
    // slot after the parent's, first generation
    let orphan = EnvId::from_raw(id.raw() + 1);
    let view = sys.env_view(orphan).unwrap();
    assert_eq!(view.status, EnvStatus::NotRunnable);
    assert_eq!(view.parent_id, id);
}
