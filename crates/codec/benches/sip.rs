use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use sip_agent_codec::message::Packet;

fn criterion_benchmark(c: &mut Criterion) {
    let mut samples = [
        b"SIP/2.0 200 OK\r\n\
          Via: SIP/2.0/UDP 192.168.179.20:5060;branch=z9hG4bK-1593064838;rport\r\n\
          From: <sip:620@192.168.179.1>;tag=1208413918\r\n\
          To: <sip:620@192.168.179.1>;tag=as58f4201c\r\n\
          Call-ID: 1991290809@192.168.179.20\r\n\
          CSeq: 21 REGISTER\r\n\
          Contact: <sip:620@192.168.179.20:5060>;expires=300\r\n\
          Content-Length: 0\r\n\
          \r\n"
            .as_slice(),
        b"SIP/2.0 401 Unauthorized\r\n\
          Via: SIP/2.0/UDP 192.168.179.20:5060;branch=z9hG4bK-1593064837;rport\r\n\
          To: <sip:620@192.168.179.1>;tag=as58f4201b\r\n\
          CSeq: 20 REGISTER\r\n\
          WWW-Authenticate: Digest algorithm=MD5, realm=\"fritz.box\", nonce=\"7EC5AF1D6F6B4ECE\"\r\n\
          Content-Length: 0\r\n\
          \r\n"
            .as_slice(),
    ]
    .into_iter()
    .cycle();

    let mut sip_criterion = c.benchmark_group("sip");

    sip_criterion.throughput(Throughput::Elements(1));
    sip_criterion.bench_function("parse_replies", |bencher| {
        bencher.iter(|| {
            Packet::parse(samples.next().unwrap()).unwrap();
        })
    });

    sip_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
