//! Transfer pipeline end to end: passive transfers, credits, resume,
//! renames and abort.

mod common;

use common::{FtpClient, TestServer};
use skua_core::{UserStore, DEFAULT_SECTION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn passive_binary_round_trip_with_owner_and_credits() {
    let server = TestServer::start("").await;
    let alice = server.add_user("alice", "pw", "3", 3);

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    assert_eq!(client.cmd("TYPE I").await.code, 200);

    let payload = vec![0xA5u8; 2048];
    let reply = client.stor("hello.bin", &payload).await;
    assert_eq!(reply.code, 226, "STOR failed: {}", reply.text);

    // The file landed under sitepath with the exact bytes.
    let on_disk = std::fs::read(server.site.path().join("hello.bin")).unwrap();
    assert_eq!(on_disk, payload);

    // The sidecar records alice as the owner.
    let sidecar = std::fs::read_to_string(server.site.path().join(".skua-owners")).unwrap();
    assert!(sidecar.contains("hello.bin"));
    assert!(sidecar.contains(&format!("\"uid\":{}", alice.uid)));

    // Upload earned ratio-multiplied credit: 2KB at 1:3.
    assert_eq!(server.credits(alice.uid, DEFAULT_SECTION).await, 6);

    // And the bytes come back verbatim.
    let (reply, body) = client.retr("hello.bin").await;
    assert_eq!(reply.code, 226);
    assert_eq!(body, payload);

    // Own files download free.
    assert_eq!(server.credits(alice.uid, DEFAULT_SECTION).await, 6);
}

#[tokio::test]
async fn download_of_foreign_file_debits_exactly_its_kilobytes() {
    let server = TestServer::start("").await;
    let alice = server.add_user("alice", "pw", "3", 3);
    let bob = server.add_user("bob", "pw", "3", 3);

    let (mut alice_client, _) = FtpClient::connect(server.addr).await;
    alice_client.login("alice", "pw").await;
    alice_client.cmd("TYPE I").await;
    assert_eq!(alice_client.stor("shared.bin", &vec![1u8; 4096]).await.code, 226);

    server
        .store
        .adjust_credits(bob.uid, DEFAULT_SECTION, 100)
        .await
        .unwrap();

    let (mut bob_client, _) = FtpClient::connect(server.addr).await;
    bob_client.login("bob", "pw").await;
    bob_client.cmd("TYPE I").await;
    let (reply, body) = bob_client.retr("shared.bin").await;
    assert_eq!(reply.code, 226);
    assert_eq!(body.len(), 4096);

    assert_eq!(server.credits(bob.uid, DEFAULT_SECTION).await, 96);
    // Alice's balance is untouched by bob's download.
    assert_eq!(server.credits(alice.uid, DEFAULT_SECTION).await, 12);
}

#[tokio::test]
async fn download_without_credits_refused_before_opening_data() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);
    let bob = server.add_user("bob", "pw", "3", 3);
    std::fs::write(server.site.path().join("big.bin"), vec![0u8; 10 * 1024]).unwrap();

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("bob", "pw").await;
    client.cmd("TYPE I").await;
    let _data = client.pasv().await;
    let reply = client.cmd("RETR big.bin").await;
    assert_eq!(reply.code, 552);
    assert_eq!(server.credits(bob.uid, DEFAULT_SECTION).await, 0);
}

#[tokio::test]
async fn upload_acl_denial_leaves_no_file_and_no_credits() {
    let server = TestServer::start("upload /priv* !*\n").await;
    let alice = server.add_user("alice", "pw", "3", 3);
    std::fs::create_dir(server.site.path().join("priv")).unwrap();

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;

    let _data = client.pasv().await;
    let reply = client.cmd("STOR /priv/x").await;
    assert_eq!(reply.code, 550);
    assert!(reply.text.contains("Permission denied"));

    assert!(!server.site.path().join("priv/x").exists());
    assert_eq!(server.credits(alice.uid, DEFAULT_SECTION).await, 0);
}

#[tokio::test]
async fn rename_two_step_moves_file_and_owner() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;
    assert_eq!(client.stor("a.txt", b"contents").await.code, 226);
    assert_eq!(client.cmd("MKD /sub").await.code, 257);

    // The staged source survives navigation between the two commands.
    assert_eq!(client.cmd("RNFR /a.txt").await.code, 350);
    assert_eq!(client.cmd("CWD /sub").await.code, 250);
    assert_eq!(client.cmd("RNTO /sub/a.txt").await.code, 250);

    assert!(!server.site.path().join("a.txt").exists());
    assert_eq!(
        std::fs::read(server.site.path().join("sub/a.txt")).unwrap(),
        b"contents"
    );
    // Ownership followed into the target directory's sidecar.
    let sub_sidecar =
        std::fs::read_to_string(server.site.path().join("sub/.skua-owners")).unwrap();
    assert!(sub_sidecar.contains("a.txt"));

    // RNTO without a fresh RNFR is a sequence error.
    let reply = client.cmd("RNTO /sub/b.txt").await;
    assert_eq!(reply.code, 503);

    // A non-navigation command discards the staged source.
    assert_eq!(client.cmd("RNFR /sub/a.txt").await.code, 350);
    assert_eq!(client.cmd("MKD /other").await.code, 257);
    assert_eq!(client.cmd("RNTO /sub/c.txt").await.code, 503);
}

#[tokio::test]
async fn rest_resumes_a_download_from_offset() {
    let server = TestServer::start("").await;
    let alice = server.add_user("alice", "pw", "3", 3);
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(server.site.path().join("big.bin"), &body).unwrap();
    server
        .store
        .adjust_credits(alice.uid, DEFAULT_SECTION, 1_000)
        .await
        .unwrap();

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;

    let offset = 150_000usize;
    assert_eq!(client.cmd(&format!("REST {}", offset)).await.code, 350);
    let (reply, tail) = client.retr("big.bin").await;
    assert_eq!(reply.code, 226);
    assert_eq!(tail, &body[offset..]);

    // Only the bytes past the offset were charged: 50000 bytes -> 49KB.
    assert_eq!(server.credits(alice.uid, DEFAULT_SECTION).await, 1_000 - 49);
}

#[tokio::test]
async fn rest_resumes_an_upload() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);
    std::fs::write(server.site.path().join("part.bin"), b"0123456789").unwrap();

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;

    assert_eq!(client.cmd("REST 4").await.code, 350);
    let reply = client.stor("part.bin", b"ABCDEF").await;
    assert_eq!(reply.code, 226);
    assert_eq!(
        std::fs::read(server.site.path().join("part.bin")).unwrap(),
        b"0123ABCDEF"
    );
}

#[tokio::test]
async fn ascii_round_trip_preserves_canonical_lf() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    assert_eq!(client.cmd("TYPE A").await.code, 200);

    // Client sends CRLF line endings; the stored file is canonical LF.
    let reply = client.stor("notes.txt", b"line one\r\nline two\r\n").await;
    assert_eq!(reply.code, 226);
    assert_eq!(
        std::fs::read(server.site.path().join("notes.txt")).unwrap(),
        b"line one\nline two\n"
    );

    // And comes back CRLF on the wire.
    let (reply, body) = client.retr("notes.txt").await;
    assert_eq!(reply.code, 226);
    assert_eq!(body, b"line one\r\nline two\r\n");
}

#[tokio::test]
async fn ascii_downloads_forces_translation_for_matching_files() {
    let server = TestServer::start("ascii_downloads 64 *.txt\n").await;
    server.add_user("alice", "pw", "3", 0);
    std::fs::write(server.site.path().join("readme.txt"), b"a\nb\n").unwrap();
    std::fs::write(server.site.path().join("data.bin"), b"x\ny\n").unwrap();

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    assert_eq!(client.cmd("TYPE I").await.code, 200);

    // A small matching file goes out translated despite TYPE I.
    let (reply, body) = client.retr("readme.txt").await;
    assert_eq!(reply.code, 226);
    assert_eq!(body, b"a\r\nb\r\n");

    // Non-matching names stay binary passthrough.
    let (reply, body) = client.retr("data.bin").await;
    assert_eq!(reply.code, 226);
    assert_eq!(body, b"x\ny\n");
}

#[tokio::test]
async fn appe_appends_to_existing_file() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);
    std::fs::write(server.site.path().join("log.txt"), b"first;").unwrap();

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;

    let mut data = client.pasv().await;
    let reply = client.cmd("APPE log.txt").await;
    assert_eq!(reply.code, 150);
    data.write_all(b"second").await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);
    assert_eq!(client.read_reply().await.code, 226);

    assert_eq!(
        std::fs::read(server.site.path().join("log.txt")).unwrap(),
        b"first;second"
    );
}

#[tokio::test]
async fn stou_creates_a_unique_name() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;

    let mut data = client.pasv().await;
    let reply = client.cmd("STOU report").await;
    assert_eq!(reply.code, 150);
    data.write_all(b"x").await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);
    let done = client.read_reply().await;
    assert_eq!(done.code, 226);
    assert!(done.text.contains("report."));
}

#[tokio::test]
async fn abor_cancels_a_paced_download_quickly() {
    // 5 KB/s ceiling makes the 200KB transfer slow enough to abort.
    let server = TestServer::start("speed_limit /slow* 0 5\n").await;
    server.add_user("alice", "pw", "3", 0);
    std::fs::create_dir(server.site.path().join("slow")).unwrap();
    std::fs::write(server.site.path().join("slow/big.bin"), vec![7u8; 200 * 1024]).unwrap();

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;

    let mut data = client.pasv().await;
    let reply = client.cmd("RETR /slow/big.bin").await;
    assert_eq!(reply.code, 150);

    // Pull a little, then abort.
    let mut buf = vec![0u8; 1024];
    let _ = data.read(&mut buf).await.unwrap();
    let started = std::time::Instant::now();
    client.send("ABOR").await;

    let first = client.read_reply().await;
    assert_eq!(first.code, 426);
    let second = client.read_reply().await;
    assert_eq!(second.code, 226);
    assert!(
        started.elapsed() < std::time::Duration::from_secs(2),
        "ABOR took {:?}",
        started.elapsed()
    );
    drop(data);

    // The session is still usable afterwards.
    assert_eq!(client.cmd("NOOP").await.code, 200);
}

#[tokio::test]
async fn listing_shows_owner_resolved_from_sidecar() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;
    assert_eq!(client.stor("mine.dat", b"abc").await.code, 226);

    let mut data = client.pasv().await;
    let reply = client.cmd("LIST").await;
    assert_eq!(reply.code, 150);
    let mut listing = String::new();
    data.read_to_string(&mut listing).await.unwrap();
    drop(data);
    assert_eq!(client.read_reply().await.code, 226);

    let line = listing
        .lines()
        .find(|l| l.contains("mine.dat"))
        .expect("uploaded file listed");
    assert!(line.contains("alice"), "owner missing from: {}", line);
    // Sidecar housekeeping files never show up.
    assert!(!listing.contains(".skua-owners"));
}

#[tokio::test]
async fn mlsd_and_mlst_facts() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;
    assert_eq!(client.stor("facts.bin", &vec![0u8; 512]).await.code, 226);

    let mut data = client.pasv().await;
    assert_eq!(client.cmd("MLSD").await.code, 150);
    let mut listing = String::new();
    data.read_to_string(&mut listing).await.unwrap();
    drop(data);
    assert_eq!(client.read_reply().await.code, 226);
    assert!(listing.contains("type=file;size=512;"));
    assert!(listing.contains("unix.owner=alice"));

    let reply = client.cmd("MLST facts.bin").await;
    assert_eq!(reply.code, 250);
    assert!(reply.lines.iter().any(|l| l.contains("size=512")));
}

#[tokio::test]
async fn dele_mkd_rmd_size_mdtm() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;
    client.cmd("TYPE I").await;
    assert_eq!(client.stor("tmp.bin", &vec![0u8; 321]).await.code, 226);

    let reply = client.cmd("SIZE tmp.bin").await;
    assert_eq!(reply.code, 213);
    assert_eq!(reply.text, "321");

    let reply = client.cmd("MDTM tmp.bin").await;
    assert_eq!(reply.code, 213);
    assert_eq!(reply.text.len(), 14);

    assert_eq!(client.cmd("MKD box").await.code, 257);
    assert_eq!(client.cmd("RMD box").await.code, 250);
    assert_eq!(client.cmd("DELE tmp.bin").await.code, 250);
    assert_eq!(client.cmd("SIZE tmp.bin").await.code, 550);
}

#[tokio::test]
async fn path_escape_is_refused() {
    let server = TestServer::start("").await;
    server.add_user("alice", "pw", "3", 3);

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;

    let reply = client.cmd("CWD ../..").await;
    assert_eq!(reply.code, 550);
    let reply = client.cmd("SIZE ../../etc/passwd").await;
    assert_eq!(reply.code, 550);
    assert!(!reply.text.contains("etc"));
}

#[tokio::test]
async fn privpath_hides_directories_from_outsiders() {
    let server = TestServer::start("privpath /staff* =staff\n").await;
    server.add_user("alice", "pw", "3", 3);
    std::fs::create_dir(server.site.path().join("staff")).unwrap();

    let (mut client, _) = FtpClient::connect(server.addr).await;
    client.login("alice", "pw").await;

    let reply = client.cmd("CWD /staff").await;
    assert_eq!(reply.code, 550);

    let mut data = client.pasv().await;
    assert_eq!(client.cmd("LIST /").await.code, 150);
    let mut listing = String::new();
    data.read_to_string(&mut listing).await.unwrap();
    drop(data);
    assert_eq!(client.read_reply().await.code, 226);
    assert!(!listing.contains("staff"));
}
