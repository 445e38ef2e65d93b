use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufStream};

use crate::mail_codec::{decode_message, encode_message, Attachment, ContentPart, IncomingMessage, OutgoingMessage};
use crate::pop3::Client;

fn decoded(message: &OutgoingMessage) -> IncomingMessage {
    let bytes = encode_message(message).unwrap();
    let mut incoming = IncomingMessage::from_bytes(bytes).unwrap();
    incoming.parse_body().unwrap();
    incoming
}

// Byte-stuffs and terminates a message the way a mailbox server sends it.
fn dot_stuffed(message: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(message);
    let mut out = String::new();
    for line in text.split("\r\n") {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out.into_bytes()
}

#[test]
fn test_simple_message_round_trip() {
    crate::init_test_log();
    let mut message = OutgoingMessage::new();
    message.set_sender("Gopher", "sender@x.org").unwrap();
    message.add_recipient("a@x.org").unwrap();
    message.add_recipient("b@x.org").unwrap();
    message.set_subject("Hello");
    message.add_content(ContentPart::plain("hi there"));

    let bytes = encode_message(&message).unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("From: Gopher <sender@x.org>\r\nTo: a@x.org, b@x.org\r\nSubject: Hello\r\nMIME-Version: 1.0\r\n"));

    let incoming = decoded(&message);
    assert_eq!(incoming.sender().name, "Gopher");
    assert_eq!(incoming.sender().address, "sender@x.org");
    let recipients: Vec<&str> = incoming.recipients().iter().map(|to| to.address.as_str()).collect();
    assert_eq!(recipients, vec!["a@x.org", "b@x.org"]);
    assert_eq!(incoming.subject(), "Hello");
    assert_eq!(incoming.contents(), &[ContentPart::plain("hi there")]);
    assert!(incoming.attachments().is_empty());
    assert!(incoming.part_errors().is_empty());
}

#[test]
fn test_mixed_message_round_trip() {
    let binary: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let html = format!("<p>{}</p><p>.leading dot and = sign</p>", "long line ".repeat(20));

    let mut message = OutgoingMessage::new();
    message.set_sender("Zażółć Gęślą", "sender@x.org").unwrap();
    message.add_recipient("to@x.org").unwrap();
    message.set_subject("Raport kwartalny: zażółć gęślą jaźń");
    message.add_content(ContentPart::html(html.clone()));
    message.add_content(ContentPart::plain("plain alternative"));
    message.attach(Attachment::new("raport.pdf", binary.clone()));
    message.attach(Attachment::new("zażółć.txt", "żółw"));

    let incoming = decoded(&message);
    assert_eq!(incoming.sender().name, "Zażółć Gęślą");
    assert_eq!(incoming.subject(), "Raport kwartalny: zażółć gęślą jaźń");
    assert_eq!(incoming.contents(), &[ContentPart::html(html), ContentPart::plain("plain alternative")]);
    assert_eq!(
        incoming.attachments(),
        &[Attachment::new("raport.pdf", binary), Attachment::new("zażółć.txt", "żółw")]
    );
}

#[test]
fn test_random_bodies_round_trip() {
    const ALPHABET: &[char] = &['a', 'Z', '7', ' ', '=', '.', '<', '>', '&', 'ż', 'ł', '€', '?', '_'];
    const NAMES: &[&str] = &["a.bin", "notatki.txt", "zdjęcie.jpg", "report 2024.pdf"];
    let mut rng = StdRng::seed_from_u64(2047);

    for _ in 0..25 {
        let mut message = OutgoingMessage::new();
        message.set_sender("Gopher", "sender@x.org").unwrap();
        message.add_recipient("a@x.org").unwrap();

        let mut contents = Vec::new();
        for _ in 0..rng.gen_range(1..4) {
            let text: String = (0..rng.gen_range(1..300)).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())]).collect();
            let part = if rng.gen_bool(0.5) { ContentPart::html(text) } else { ContentPart::plain(text) };
            message.add_content(part.clone());
            contents.push(part);
        }
        let mut attachments = Vec::new();
        for _ in 0..rng.gen_range(0..3) {
            let data: Vec<u8> = (0..rng.gen_range(1..500)).map(|_| rng.gen()).collect();
            let attachment = Attachment::new(NAMES[rng.gen_range(0..NAMES.len())], data);
            message.attach(attachment.clone());
            attachments.push(attachment);
        }

        let incoming = decoded(&message);
        assert_eq!(incoming.contents(), &contents[..]);
        assert_eq!(incoming.attachments(), &attachments[..]);
    }
}

#[test]
fn test_encoding_needs_sender_and_recipients() {
    let mut message = OutgoingMessage::new();
    message.add_recipient("to@x.org").unwrap();
    assert!(encode_message(&message).is_err());

    let mut message = OutgoingMessage::new();
    message.set_sender("Gopher", "sender@x.org").unwrap();
    assert!(encode_message(&message).is_err());
}

#[tokio::test]
async fn test_retrieve_encoded_message_over_pop3() {
    let mut message = OutgoingMessage::new();
    message.set_sender("Gopher", "sender@x.org").unwrap();
    message.add_recipient("to@x.org").unwrap();
    message.set_subject("Over the wire");
    message.add_content(ContentPart::html(".starts with a dot and goes on"));
    message.attach(Attachment::new("notes.txt", ".\r\n.."));
    let body = dot_stuffed(&encode_message(&message).unwrap());

    let (client_side, server_side) = duplex(256 * 1024);
    let server = tokio::spawn(async move {
        let mut server = BufStream::new(server_side);
        server.write_all(b"+OK ready\r\n").await.unwrap();
        server.flush().await.unwrap();
        let replies: Vec<Vec<u8>> = vec![
            b"+OK\r\n".to_vec(),
            b"+OK\r\n".to_vec(),
            [b"+OK message follows\r\n".to_vec(), body].concat(),
            b"+OK bye\r\n".to_vec(),
        ];
        for reply in replies {
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            server.write_all(&reply).await.unwrap();
            server.flush().await.unwrap();
        }
    });

    let mut client = Client::new(client_side).await.unwrap();
    client.authenticate("gopher", "secret").await.unwrap();
    let mut reader = client.retrieve(1).await.unwrap();
    let mut incoming = decode_message(&mut reader).await.unwrap();
    client.close().await.unwrap();
    server.await.unwrap();

    incoming.parse_body().unwrap();
    assert_eq!(incoming.subject(), "Over the wire");
    assert_eq!(incoming.contents(), &[ContentPart::html(".starts with a dot and goes on")]);
    assert_eq!(incoming.attachments(), &[Attachment::new("notes.txt", ".\r\n..")]);
}
