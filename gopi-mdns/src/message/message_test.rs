use std::net::{Ipv4Addr, Ipv6Addr};

use super::*;

fn name(s: &str) -> Name {
    Name::new(s).unwrap()
}

fn service_response() -> Message {
    let instance = name("Living\\ Room._googlecast._tcp.local.");
    Message {
        header: Header {
            response: true,
            authoritative: true,
            ..Default::default()
        },
        answers: vec![Resource::new(
            name("_googlecast._tcp.local."),
            120,
            Box::new(PtrResource {
                ptr: instance.clone(),
            }),
        )],
        additionals: vec![
            Resource::new(
                instance.clone(),
                120,
                Box::new(SrvResource {
                    priority: 10,
                    weight: 1,
                    port: 8009,
                    target: name("chromecast.local."),
                }),
            ),
            Resource::new(
                instance,
                120,
                Box::new(TxtResource {
                    txt: vec!["id=abc".to_owned(), "fn=Living Room".to_owned()],
                }),
            ),
            Resource::new(
                name("chromecast.local."),
                120,
                Box::new(AResource::new(Ipv4Addr::new(192, 168, 1, 20))),
            ),
            Resource::new(
                name("chromecast.local."),
                120,
                Box::new(AaaaResource::new(Ipv6Addr::new(
                    0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x20,
                ))),
            ),
        ],
        ..Default::default()
    }
}

#[test]
fn test_encode_decode_service_response() -> Result<()> {
    let mut msg = service_response();
    let packed = encode(&mut msg)?;
    let got = decode(&packed)?;

    assert!(got.header.response);
    assert!(got.header.authoritative);
    assert_eq!(got.header.id, 0);
    assert_eq!(got.answers.len(), 1);
    assert_eq!(got.additionals.len(), 4);

    let ptr = got.answers[0].ptr().unwrap();
    assert_eq!(ptr.ptr.data, "Living\\ Room._googlecast._tcp.local.");
    assert_eq!(got.answers[0].header.ttl, 120);
    assert_eq!(got.answers[0].header.typ, DnsType::Ptr);

    let srv = got.additionals[0].srv().unwrap();
    assert_eq!(srv.port, 8009);
    assert_eq!(srv.target.data, "chromecast.local.");
    assert_eq!(
        got.additionals[1].txt().unwrap().txt,
        vec!["id=abc".to_owned(), "fn=Living Room".to_owned()]
    );
    assert_eq!(
        got.additionals[2].a().unwrap().addr(),
        Ipv4Addr::new(192, 168, 1, 20)
    );
    assert_eq!(
        got.additionals[3].aaaa().unwrap().addr(),
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x20)
    );
    assert_eq!(got.records().count(), 5);

    Ok(())
}

#[test]
fn test_encode_compresses_names() -> Result<()> {
    let mut msg = service_response();
    let packed = encode(&mut msg)?;

    // "_googlecast._tcp.local." is spelled out once and pointed at afterwards.
    let needle = b"\x0b_googlecast";
    let hits = packed
        .windows(needle.len())
        .filter(|w| *w == &needle[..])
        .count();
    assert_eq!(hits, 1);
    Ok(())
}

#[test]
fn test_encode_sets_lengths() -> Result<()> {
    let mut msg = service_response();
    encode(&mut msg)?;
    assert_eq!(msg.additionals[2].header.length, 4);
    assert_eq!(msg.additionals[3].header.length, 16);
    Ok(())
}

#[test]
fn test_decode_query() -> Result<()> {
    let mut msg = Message {
        questions: vec![Question {
            name: name("_services._dns-sd._udp.local."),
            typ: DnsType::Ptr,
            class: DnsClass(DNSCLASS_INET.0 | CLASS_TOP_BIT),
        }],
        ..Default::default()
    };
    let got = decode(&encode(&mut msg)?)?;
    assert!(!got.header.response);
    assert!(!got.header.recursion_desired);
    assert_eq!(got.questions.len(), 1);
    assert_eq!(got.questions[0].name.data, "_services._dns-sd._udp.local.");
    assert!(got.questions[0].unicast_response());
    Ok(())
}

#[test]
fn test_decode_rejects_non_mdns_headers() -> Result<()> {
    let mut truncated = Message {
        header: Header {
            truncated: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut opcode = Message {
        header: Header {
            op_code: 5,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut rcode = Message {
        header: Header {
            response: true,
            rcode: RCode::NameError,
            ..Default::default()
        },
        ..Default::default()
    };

    for msg in [&mut truncated, &mut opcode, &mut rcode] {
        let packed = encode(msg)?;
        let err = decode(&packed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadMessage, "{err}");
    }
    Ok(())
}

#[test]
fn test_decode_short_payload() {
    assert_eq!(decode(&[0xff, 0xff]).unwrap_err(), Error::ErrBaseLen);
    assert_eq!(decode(&[]).unwrap_err(), Error::ErrBaseLen);
}

#[test]
fn test_decode_truncated_record() -> Result<()> {
    let mut msg = service_response();
    let packed = encode(&mut msg)?;
    let err = decode(&packed[..packed.len() - 3]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadMessage, "{err}");
    Ok(())
}

#[test]
fn test_decode_unknown_type_is_opaque() -> Result<()> {
    let mut msg = Message {
        header: Header {
            response: true,
            ..Default::default()
        },
        answers: vec![Resource::new(
            name("h.local."),
            120,
            Box::new(AResource::new(Ipv4Addr::new(10, 0, 0, 1))),
        )],
        ..Default::default()
    };
    let mut packed = encode(&mut msg)?;
    // Rewrite the record type (right after the 12 byte header and the name
    // "h.local." which takes 9 bytes) from A to HINFO.
    let type_off = HEADER_LEN + 9;
    assert_eq!(&packed[type_off..type_off + 2], &[0, 1]);
    packed[type_off + 1] = 13;

    let got = decode(&packed)?;
    assert_eq!(got.answers[0].header.typ, DnsType::Unsupported);
    let body = got.answers[0].body.as_ref().unwrap();
    let unknown = body.as_any().downcast_ref::<UnknownResource>().unwrap();
    assert_eq!(unknown.typ, 13);
    assert_eq!(unknown.data, vec![10, 0, 0, 1]);
    assert!(got.answers[0].a().is_none());

    // Opaque records cannot be sent back out.
    let mut echo = got;
    assert_eq!(encode(&mut echo).unwrap_err(), Error::ErrUnsupportedType(13));
    Ok(())
}

#[test]
fn test_txt_empty_and_lossy() -> Result<()> {
    let mut msg = Message {
        answers: vec![Resource::new(
            name("x._gopi._tcp.local."),
            120,
            Box::new(TxtResource { txt: vec![] }),
        )],
        ..Default::default()
    };
    let mut packed = encode(&mut msg)?;
    // An empty TXT still carries one zero-length string.
    assert_eq!(msg.answers[0].header.length, 1);
    assert_eq!(decode(&packed)?.answers[0].txt().unwrap().txt.len(), 0);

    msg.answers[0].body = Some(Box::new(TxtResource {
        txt: vec!["k=v".to_owned()],
    }));
    packed = encode(&mut msg)?;
    let last = packed.len() - 1;
    packed[last] = 0xff;
    let got = decode(&packed)?;
    assert_eq!(got.answers[0].txt().unwrap().txt, vec!["k=\u{fffd}".to_owned()]);
    Ok(())
}

#[test]
fn test_txt_entry_too_long() {
    let mut msg = Message {
        answers: vec![Resource::new(
            name("x._gopi._tcp.local."),
            120,
            Box::new(TxtResource {
                txt: vec!["a".repeat(256)],
            }),
        )],
        ..Default::default()
    };
    assert_eq!(encode(&mut msg).unwrap_err(), Error::ErrStringTooLong);
}

#[test]
fn test_parser_section_order() -> Result<()> {
    let mut msg = service_response();
    let packed = encode(&mut msg)?;

    let mut p = Parser::default();
    p.start(&packed)?;
    assert_eq!(p.all_answers().unwrap_err(), Error::ErrNotStarted);
    p.all_questions()?;
    p.all_answers()?;
    assert_eq!(p.all_questions().unwrap_err(), Error::ErrSectionDone);
    Ok(())
}
