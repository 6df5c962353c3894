//! Server gateway self-tests: header framing and reply echoing.

use super::gateway;
use super::message::{fill_path, MessageHeader, ResponseHeader, COMMAND_OPEN};
use crate::process::kthread_create;
use zerocopy::{AsBytes, FromBytes};

pub fn create_server_test_task() {
    kthread_create(server_test_main, 0, "server-test").expect("server test task");
}

fn check(name: &str, ok: bool) -> bool {
    if ok {
        crate::kprintln!("[server-test] {}: ok", name);
    } else {
        crate::kprintln!("[server-test] {}: FAIL", name);
    }
    ok
}

extern "C" fn server_test_main(_arg: u64) -> ! {
    let mut pass = true;

    // Header round-trips through its byte representation unchanged.
    let mut header = MessageHeader::request(COMMAND_OPEN, 128);
    header.id = 0x1122_3344_5566_7788;
    header.requester = 42;
    let bytes = header.as_bytes();
    let parsed = MessageHeader::read_from(bytes).unwrap();
    pass &= check(
        "header-roundtrip",
        parsed.command == COMMAND_OPEN
            && parsed.length == 128
            && parsed.response == 0
            && parsed.id == header.id
            && parsed.requester == 42,
    );

    // A reply echoes id and command and flips the response tag.
    let reply = header.reply(core::mem::size_of::<ResponseHeader>());
    pass &= check(
        "reply-echoes-id",
        reply.id == header.id && reply.command == header.command && reply.response == 1,
    );

    // Path fields are NUL-terminated and truncated safely.
    let mut field = [0xFFu8; 16];
    fill_path(&mut field, "abc");
    pass &= check(
        "fill-path-terminates",
        &field[..4] == b"abc\0" && field[15] == 0,
    );
    let mut tiny = [0u8; 4];
    fill_path(&mut tiny, "overlong-path");
    pass &= check("fill-path-truncates", tiny[3] == 0);

    // Nothing is pending before lumen exists.
    pass &= check("pending-table-empty", gateway::pending_count() == 0);

    crate::kprintln!(
        "[server-test] summary: {}",
        if pass { "PASS" } else { "FAIL" }
    );
    loop {
        crate::arch::x86_64::idle();
    }
}
