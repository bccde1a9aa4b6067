// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end request flows through the dispatcher

use std::sync::Arc;
use std::time::Duration;

use ninep_proto::flags::dotl;
use ninep_proto::messages::{
    Tattach, Tclunk, Tflush, Tgetattr, Tlcreate, Tmkdir, Tread, Treaddir, Trenameat, Tunlinkat,
    Tversion, Twalk, Twrite, Txattrcreate, Txattrwalk,
};
use ninep_proto::{Data, Dirent, Name, Rmessage, WireFormat, NOFID};

use crate::backend::MockBackend;
use crate::config::{MultiDevicePolicy, SessionConfig};
use crate::error::FsError;
use crate::reclaim::{FdBudget, FdLimits};
use crate::testing::{MemBackend, TestClient, ROOT_DEV};

const ROOT: u32 = 0;

fn read_data(reply: Rmessage) -> Vec<u8> {
    match reply {
        Rmessage::Read(r) => r.data.0,
        other => panic!("expected Rread, got {other:?}"),
    }
}

fn ecode(reply: Rmessage) -> i32 {
    match reply {
        Rmessage::Lerror(r) => r.ecode as i32,
        other => panic!("expected Rlerror, got {other:?}"),
    }
}

async fn read_all(client: &mut TestClient, fid: u32) -> Vec<u8> {
    read_data(
        client
            .call(Tread {
                fid,
                offset: 0,
                count: 4096,
            })
            .await,
    )
}

#[tokio::test]
async fn walk_open_and_read() {
    let backend = Arc::new(
        MemBackend::new()
            .with_dir("a")
            .with_file("a/b", b"hello world"),
    );
    let mut client = TestClient::new(SessionConfig::default(), backend);
    client.attach(ROOT).await;

    match client.walk(ROOT, 1, "a/b").await {
        Rmessage::Walk(r) => assert_eq!(r.wqids.len(), 2),
        other => panic!("walk failed: {other:?}"),
    }
    match client.lopen(1, libc::O_RDONLY).await {
        Rmessage::Lopen(r) => assert!(r.iounit > 0),
        other => panic!("open failed: {other:?}"),
    }
    assert_eq!(read_all(&mut client, 1).await, b"hello world");
}

#[tokio::test]
async fn partial_walk_reports_walked_prefix() {
    let backend = Arc::new(MemBackend::new().with_dir("a"));
    let mut client = TestClient::new(SessionConfig::default(), backend);
    client.attach(ROOT).await;

    match client.walk(ROOT, 1, "a/missing").await {
        Rmessage::Walk(r) => assert_eq!(r.wqids.len(), 1),
        other => panic!("expected partial walk, got {other:?}"),
    }
    // newfid is only created by a complete walk
    let reply = client
        .call(Tgetattr {
            fid: 1,
            request_mask: 0,
        })
        .await;
    assert_eq!(ecode(reply), libc::ENOENT);
    assert_eq!(ecode(client.walk(ROOT, 1, "missing").await), libc::ENOENT);
}

#[tokio::test]
async fn idle_descriptors_are_reclaimed_and_reopened() {
    const FILES: u32 = 8;
    let mut backend = MemBackend::new();
    for i in 0..FILES {
        backend = backend.with_file(&format!("f{i}"), format!("file {i}").as_bytes());
    }
    let backend = Arc::new(backend);
    let limits = FdLimits {
        high_water: 4,
        reclaim_target: 2,
    };
    let mut client = TestClient::with_limits(SessionConfig::default(), backend.clone(), limits);
    client.attach(ROOT).await;

    for i in 0..FILES {
        let fid = 10 + i;
        assert!(matches!(
            client.walk(ROOT, fid, &format!("f{i}")).await,
            Rmessage::Walk(_)
        ));
        assert!(matches!(
            client.lopen(fid, libc::O_RDONLY).await,
            Rmessage::Lopen(_)
        ));
    }
    assert!(backend.closes() > 0, "nothing was reclaimed");
    assert!(backend.open_handles() < FILES as usize);

    for i in 0..FILES {
        let fid = 10 + i;
        assert!(matches!(
            client
                .call(Tgetattr {
                    fid,
                    request_mask: 0
                })
                .await,
            Rmessage::Getattr(_)
        ));
        assert_eq!(read_all(&mut client, fid).await, format!("file {i}").as_bytes());
    }
    assert!(backend.opens() > FILES as usize, "no fid was reopened");
}

#[tokio::test]
async fn reclaim_reaches_idle_fids_of_other_sessions() {
    let budget = Arc::new(FdBudget::new(FdLimits {
        high_water: 1,
        reclaim_target: 4,
    }));
    let quiet = Arc::new(MemBackend::new().with_file("a", b"quiet"));
    let mut busy_backend = MemBackend::new();
    for i in 0..4 {
        busy_backend = busy_backend.with_file(&format!("b{i}"), b"");
    }
    let busy_backend = Arc::new(busy_backend);

    let mut idle = TestClient::with_budget(SessionConfig::default(), quiet.clone(), budget.clone());
    idle.attach(ROOT).await;
    idle.walk(ROOT, 10, "a").await;
    assert!(matches!(
        idle.lopen(10, libc::O_RDONLY).await,
        Rmessage::Lopen(_)
    ));
    assert_eq!(budget.open_count(), 1);

    let mut busy = TestClient::with_budget(SessionConfig::default(), busy_backend, budget.clone());
    busy.attach(ROOT).await;
    for i in 0..4 {
        let fid = 20 + i;
        busy.walk(ROOT, fid, &format!("b{i}")).await;
        assert!(matches!(
            busy.lopen(fid, libc::O_RDONLY).await,
            Rmessage::Lopen(_)
        ));
    }

    // The idle session never crossed the mark itself.
    assert_eq!(quiet.closes(), 1);
    assert_eq!(quiet.open_handles(), 0);
    assert!(budget.open_count() < 5);

    assert_eq!(read_all(&mut idle, 10).await, b"quiet");
    assert_eq!(quiet.opens(), 2);
}

#[tokio::test]
async fn remapped_inodes_stay_distinct_across_devices() {
    let backend = Arc::new(
        MemBackend::new()
            .with_file_on("x", ROOT_DEV, 5, b"")
            .with_dir_on("mnt", 2)
            .with_file_on("mnt/y", 2, 5, b""),
    );
    let config = SessionConfig {
        multidevs: MultiDevicePolicy::Remap,
        ..SessionConfig::default()
    };
    let mut client = TestClient::new(config, backend);
    client.attach(ROOT).await;

    let qid_of = |reply: Rmessage| match reply {
        Rmessage::Walk(r) => *r.wqids.last().unwrap(),
        other => panic!("walk failed: {other:?}"),
    };
    let x = qid_of(client.walk(ROOT, 1, "x").await);
    let y = qid_of(client.walk(ROOT, 2, "mnt/y").await);
    assert_ne!(x.path, y.path);

    // Same answer on a second lookup.
    let again = qid_of(client.walk(ROOT, 3, "mnt/y").await);
    assert_eq!(again.path, y.path);
}

#[tokio::test]
async fn forbidden_second_device_is_refused() {
    let backend = Arc::new(
        MemBackend::new()
            .with_dir_on("mnt", 2)
            .with_file_on("mnt/y", 2, 5, b""),
    );
    let config = SessionConfig {
        multidevs: MultiDevicePolicy::Forbid,
        ..SessionConfig::default()
    };
    let mut client = TestClient::new(config, backend);
    client.attach(ROOT).await;
    assert_eq!(ecode(client.walk(ROOT, 1, "mnt").await), libc::ENODEV);
}

#[tokio::test]
async fn rename_moves_held_fids() {
    let backend = Arc::new(
        MemBackend::new()
            .with_dir("a")
            .with_file("a/c", b"inside"),
    );
    let mut client = TestClient::new(SessionConfig::default(), backend.clone());
    client.attach(ROOT).await;
    assert!(matches!(client.walk(ROOT, 1, "a/c").await, Rmessage::Walk(_)));

    let reply = client
        .call(Trenameat {
            olddirfid: ROOT,
            oldname: "a".into(),
            newdirfid: ROOT,
            newname: "b".into(),
        })
        .await;
    assert!(matches!(reply, Rmessage::Renameat(_)), "{reply:?}");
    assert!(backend.exists("b/c"));

    assert!(matches!(
        client
            .call(Tgetattr {
                fid: 1,
                request_mask: 0
            })
            .await,
        Rmessage::Getattr(_)
    ));
    assert!(matches!(
        client.lopen(1, libc::O_RDONLY).await,
        Rmessage::Lopen(_)
    ));
    assert_eq!(read_all(&mut client, 1).await, b"inside");
}

#[tokio::test]
async fn flushed_write_gets_no_reply() {
    let backend = Arc::new(MemBackend::new().with_file("f", b""));
    let mut client = TestClient::new(SessionConfig::default(), backend.clone());
    client.attach(ROOT).await;
    client.walk(ROOT, 1, "f").await;
    assert!(matches!(
        client.lopen(1, libc::O_WRONLY).await,
        Rmessage::Lopen(_)
    ));

    backend.hold_writes();
    let write = client.send(Twrite {
        fid: 1,
        offset: 0,
        data: Data(b"slow".to_vec()),
    });
    while backend.blocked_writes() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let flush = client.send(Tflush { oldtag: write });
    let target = client.session().active().get(write).unwrap();
    while !target.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    backend.release_writes(true);

    assert!(matches!(client.reply(flush).await, Rmessage::Flush(_)));
    // A write reply would have been queued before the flush reply.
    assert!(client.try_reply(write).is_none());
    assert!(client.session().active().is_empty());
}

#[tokio::test]
async fn flush_after_completion_keeps_the_reply() {
    let backend = Arc::new(MemBackend::new().with_file("f", b""));
    let mut client = TestClient::new(SessionConfig::default(), backend.clone());
    client.attach(ROOT).await;
    client.walk(ROOT, 1, "f").await;
    client.lopen(1, libc::O_WRONLY).await;

    backend.hold_writes();
    let write = client.send(Twrite {
        fid: 1,
        offset: 0,
        data: Data(b"done".to_vec()),
    });
    while backend.blocked_writes() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let flush = client.send(Tflush { oldtag: write });
    let target = client.session().active().get(write).unwrap();
    while !target.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    // The write itself completes; only interrupted I/O is discarded.
    backend.release_writes(false);

    match client.reply(write).await {
        Rmessage::Write(r) => assert_eq!(r.count, 4),
        other => panic!("expected Rwrite, got {other:?}"),
    }
    assert!(matches!(client.reply(flush).await, Rmessage::Flush(_)));
    assert_eq!(backend.contents("f").unwrap(), b"done");
}

#[tokio::test]
async fn flush_of_unknown_tag_replies_immediately() {
    let backend = Arc::new(MemBackend::new());
    let mut client = TestClient::new(SessionConfig::default(), backend);
    client.attach(ROOT).await;
    assert!(matches!(
        client.call(Tflush { oldtag: 999 }).await,
        Rmessage::Flush(_)
    ));
}

#[tokio::test]
async fn readonly_export_rejects_mutation() {
    let backend = Arc::new(MemBackend::new().with_file("f", b"x"));
    let config = SessionConfig {
        readonly: true,
        ..SessionConfig::default()
    };
    let mut client = TestClient::new(config, backend.clone());
    client.attach(ROOT).await;

    let reply = client
        .call(Tmkdir {
            dfid: ROOT,
            name: "d".into(),
            mode: 0o755,
            gid: 0,
        })
        .await;
    assert_eq!(ecode(reply), libc::EROFS);
    client.walk(ROOT, 1, "f").await;
    assert_eq!(ecode(client.lopen(1, libc::O_RDWR).await), libc::EROFS);
    assert!(!backend.exists("d"));
}

#[tokio::test]
async fn create_write_and_read_back() {
    let backend = Arc::new(MemBackend::new());
    let mut client = TestClient::new(SessionConfig::default(), backend.clone());
    client.attach(ROOT).await;
    client.walk(ROOT, 1, "").await;

    let reply = client
        .call(Tlcreate {
            fid: 1,
            name: "new".into(),
            flags: dotl::RDWR,
            mode: 0o644,
            gid: 0,
        })
        .await;
    assert!(matches!(reply, Rmessage::Lcreate(_)), "{reply:?}");
    let reply = client
        .call(Twrite {
            fid: 1,
            offset: 0,
            data: Data(b"payload".to_vec()),
        })
        .await;
    assert!(matches!(reply, Rmessage::Write(_)));
    assert_eq!(read_all(&mut client, 1).await, b"payload");
    assert!(matches!(
        client.call(Tclunk { fid: 1 }).await,
        Rmessage::Clunk(_)
    ));
    assert_eq!(backend.contents("new").unwrap(), b"payload");
    assert_eq!(backend.open_handles(), 0);
}

#[tokio::test]
async fn readdir_pages_through_entries() {
    let mut backend = MemBackend::new().with_dir("d");
    for i in 0..20 {
        backend = backend.with_file(&format!("d/entry{i:02}"), b"");
    }
    let mut client = TestClient::new(SessionConfig::default(), Arc::new(backend));
    client.attach(ROOT).await;
    client.walk(ROOT, 1, "d").await;
    client.lopen(1, libc::O_RDONLY | libc::O_DIRECTORY).await;

    let mut names = Vec::new();
    let mut offset = 0;
    loop {
        let data = match client
            .call(Treaddir {
                fid: 1,
                offset,
                count: 128,
            })
            .await
        {
            Rmessage::Readdir(r) => r.data.0,
            other => panic!("readdir failed: {other:?}"),
        };
        if data.is_empty() {
            break;
        }
        assert!(data.len() <= 128);
        let mut buf = &data[..];
        while !buf.is_empty() {
            let entry = Dirent::decode(&mut buf).unwrap();
            offset = entry.offset;
            names.push(entry.name);
        }
    }
    assert_eq!(names.len(), 22);
    assert_eq!(&names[..2], &[".", ".."]);
    assert_eq!(names[2], "entry00");
    assert_eq!(names[21], "entry19");
}

#[tokio::test]
async fn xattr_create_commits_on_clunk() {
    let backend = Arc::new(MemBackend::new().with_file("f", b""));
    let mut client = TestClient::new(SessionConfig::default(), backend.clone());
    client.attach(ROOT).await;
    client.walk(ROOT, 1, "f").await;

    let reply = client
        .call(Txattrcreate {
            fid: 1,
            name: "user.tag".into(),
            attr_size: 5,
            flags: 0,
        })
        .await;
    assert!(matches!(reply, Rmessage::Xattrcreate(_)), "{reply:?}");
    client
        .call(Twrite {
            fid: 1,
            offset: 0,
            data: Data(b"value".to_vec()),
        })
        .await;
    assert!(matches!(
        client.call(Tclunk { fid: 1 }).await,
        Rmessage::Clunk(_)
    ));

    client.walk(ROOT, 2, "f").await;
    let reply = client
        .call(Txattrwalk {
            fid: 2,
            newfid: 3,
            name: "user.tag".into(),
        })
        .await;
    match reply {
        Rmessage::Xattrwalk(r) => assert_eq!(r.size, 5),
        other => panic!("xattrwalk failed: {other:?}"),
    }
    assert_eq!(read_all(&mut client, 3).await, b"value");
}

#[tokio::test]
async fn short_xattr_write_fails_the_clunk() {
    let backend = Arc::new(MemBackend::new().with_file("f", b""));
    let mut client = TestClient::new(SessionConfig::default(), backend);
    client.attach(ROOT).await;
    client.walk(ROOT, 1, "f").await;
    client
        .call(Txattrcreate {
            fid: 1,
            name: "user.tag".into(),
            attr_size: 5,
            flags: 0,
        })
        .await;
    client
        .call(Twrite {
            fid: 1,
            offset: 0,
            data: Data(b"va".to_vec()),
        })
        .await;
    assert_eq!(ecode(client.call(Tclunk { fid: 1 }).await), libc::EINVAL);
}

#[tokio::test]
async fn unlink_removes_entry() {
    let backend = Arc::new(MemBackend::new().with_dir("d").with_file("f", b""));
    let mut client = TestClient::new(SessionConfig::default(), backend.clone());
    client.attach(ROOT).await;

    let reply = client
        .call(Tunlinkat {
            dirfid: ROOT,
            name: "d".into(),
            flags: 0,
        })
        .await;
    assert_eq!(ecode(reply), libc::EISDIR);
    let reply = client
        .call(Tunlinkat {
            dirfid: ROOT,
            name: "f".into(),
            flags: 0,
        })
        .await;
    assert!(matches!(reply, Rmessage::Unlinkat(_)));
    assert!(!backend.exists("f"));
}

#[tokio::test]
async fn version_resets_fids() {
    let backend = Arc::new(MemBackend::new().with_file("f", b""));
    let mut client = TestClient::new(SessionConfig::default(), backend.clone());
    client.attach(ROOT).await;
    client.walk(ROOT, 1, "f").await;
    client.lopen(1, libc::O_RDONLY).await;
    assert_eq!(backend.open_handles(), 1);

    client.attach(5).await;
    assert_eq!(backend.open_handles(), 0);
    let reply = client
        .call(Tgetattr {
            fid: 1,
            request_mask: 0,
        })
        .await;
    assert_eq!(ecode(reply), libc::ENOENT);
}

#[tokio::test]
async fn version_waits_for_in_flight_write() {
    let backend = Arc::new(MemBackend::new().with_file("f", b""));
    let mut client = TestClient::new(SessionConfig::default(), backend.clone());
    client.attach(ROOT).await;
    client.walk(ROOT, 1, "f").await;
    client.lopen(1, libc::O_WRONLY).await;

    backend.hold_writes();
    let write = client.send(Twrite {
        fid: 1,
        offset: 0,
        data: Data(b"late".to_vec()),
    });
    while backend.blocked_writes() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let version = client.send(Tversion {
        msize: 8192,
        version: "9P2000.L".into(),
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(client.try_reply(version).is_none(), "version overtook the write");
    assert_eq!(backend.open_handles(), 1);

    backend.release_writes(false);
    match client.reply(write).await {
        Rmessage::Write(r) => assert_eq!(r.count, 4),
        other => panic!("expected Rwrite, got {other:?}"),
    }
    assert!(matches!(client.reply(version).await, Rmessage::Version(_)));
    assert_eq!(backend.open_handles(), 0);
    assert_eq!(backend.contents("f").unwrap(), b"late");
    assert!(client.session().active().is_empty());
}

#[tokio::test]
async fn fid_in_the_wrong_state_is_refused() {
    let backend = Arc::new(MemBackend::new().with_dir("d").with_file("f", b"x"));
    let mut client = TestClient::new(SessionConfig::default(), backend);
    client.attach(ROOT).await;

    client.walk(ROOT, 1, "f").await;
    let reply = client
        .call(Tread {
            fid: 1,
            offset: 0,
            count: 16,
        })
        .await;
    assert_eq!(ecode(reply), libc::EINVAL);

    client.lopen(1, libc::O_RDONLY).await;
    assert_eq!(ecode(client.walk(1, 2, "").await), libc::EINVAL);
    assert_eq!(ecode(client.lopen(1, libc::O_RDONLY).await), libc::EINVAL);

    client.walk(ROOT, 3, "d").await;
    client.lopen(3, libc::O_RDONLY | libc::O_DIRECTORY).await;
    let reply = client
        .call(Twrite {
            fid: 3,
            offset: 0,
            data: Data(b"no".to_vec()),
        })
        .await;
    assert_eq!(ecode(reply), libc::EINVAL);
}

#[tokio::test]
async fn names_that_are_not_utf8_round_trip() {
    let backend = Arc::new(MemBackend::new());
    let mut client = TestClient::new(SessionConfig::default(), backend);
    client.attach(ROOT).await;
    let raw = Name(b"caf\xe9".to_vec());

    let reply = client
        .call(Tmkdir {
            dfid: ROOT,
            name: raw.clone(),
            mode: 0o755,
            gid: 0,
        })
        .await;
    assert!(matches!(reply, Rmessage::Mkdir(_)), "{reply:?}");

    client.walk(ROOT, 1, "").await;
    client.lopen(1, libc::O_RDONLY | libc::O_DIRECTORY).await;
    let data = match client
        .call(Treaddir {
            fid: 1,
            offset: 0,
            count: 4096,
        })
        .await
    {
        Rmessage::Readdir(r) => r.data.0,
        other => panic!("readdir failed: {other:?}"),
    };
    let mut buf = &data[..];
    let mut listed = Vec::new();
    while !buf.is_empty() {
        listed.push(Dirent::decode(&mut buf).unwrap().name);
    }
    assert!(listed.contains(&raw), "{listed:?}");

    let reply = client
        .call(Twalk {
            fid: ROOT,
            newfid: 2,
            wnames: vec![raw],
        })
        .await;
    match reply {
        Rmessage::Walk(r) => assert_eq!(r.wqids.len(), 1),
        other => panic!("walk failed: {other:?}"),
    }
}

#[tokio::test]
async fn backend_errno_reaches_the_client() {
    let mut backend = MockBackend::new();
    backend.expect_is_path_based().return_const(true);
    backend
        .expect_lstat()
        .returning(|_| Err(FsError::from_errno(libc::EACCES)));
    let mut client = TestClient::new(SessionConfig::default(), Arc::new(backend));

    let reply = client
        .call(Tversion {
            msize: 8192,
            version: "9P2000.L".into(),
        })
        .await;
    assert!(matches!(reply, Rmessage::Version(_)));
    let reply = client
        .call(Tattach {
            fid: ROOT,
            afid: NOFID,
            uname: "user".into(),
            aname: String::new(),
            n_uname: 1000,
        })
        .await;
    assert_eq!(ecode(reply), libc::EACCES);
    // A failed attach leaves no fid behind.
    assert!(client.session().fids().is_empty());
}
