//! 에러 코드 상수 정의
//!
//! 이벤트 로그에 기록되는 실패 항목을 구분하기 위한 안정적인 문자열 코드입니다.

/// 원본 파일이 없거나 일반 파일이 아님
pub const ERR_SOURCE_MISSING: &str = "ERR_SOURCE_MISSING";

/// 원본 파일 읽기 권한 없음
pub const ERR_PERMISSION_DENIED: &str = "ERR_PERMISSION_DENIED";

/// 대상 파일이 이미 존재함 (덮어쓰지 않음)
pub const ERR_DEST_EXISTS: &str = "ERR_DEST_EXISTS";

/// 대상 경로의 상위 디렉토리를 결정할 수 없음
pub const ERR_PARENT_UNDETERMINABLE: &str = "ERR_PARENT_UNDETERMINABLE";

/// 디렉토리 생성 실패
pub const ERR_DIR_CREATE_FAILED: &str = "ERR_DIR_CREATE_FAILED";

/// 복사 스트림 I/O 실패
pub const ERR_COPY_STREAM: &str = "ERR_COPY_STREAM";

/// 복사 후 크기 불일치
pub const ERR_SIZE_MISMATCH: &str = "ERR_SIZE_MISMATCH";

/// 대기 시간 초과 후에도 원본 파일이 비어 있음
pub const ERR_SOURCE_EMPTY: &str = "ERR_SOURCE_EMPTY";

/// 감시 시작 실패
pub const ERR_WATCH_START_FAILED: &str = "ERR_WATCH_START_FAILED";
